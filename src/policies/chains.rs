use super::rules;

/// Where the FORWARD jump into our chains must sit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JumpPosition {
    /// right after the last of the KUBE-FORWARD and KUBE-SERVICES jumps
    #[default]
    AfterKubeServices,
    First,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JumpState {
    Absent,
    Correct,
    Misplaced,
}

/// Chains our jump must come after.
const KUBE_CHAINS: [&str; 2] = ["KUBE-FORWARD", "KUBE-SERVICES"];

/// What to do with the FORWARD jump.
#[derive(Debug, PartialEq, Eq)]
pub(super) struct JumpPlan {
    pub state: JumpState,
    /// 1-based index to insert at, after deleting the current jump when misplaced
    pub insert_at: usize,
}

/// Parse `iptables -n -L FORWARD --line-numbers` into `(num, target)` pairs.
pub(super) fn parse_rules(listing: &str) -> Vec<(usize, String)> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let num = fields.next()?.parse().ok()?;
            let target = fields.next()?;
            Some((num, target.to_string()))
        })
        .collect()
}

pub(super) fn plan_jump(rules: &[(usize, String)], position: JumpPosition) -> JumpPlan {
    let ours = (rules.iter())
        .find(|(_, target)| target == rules::MAIN_CHAIN)
        .map(|(num, _)| *num);

    match position {
        JumpPosition::First => JumpPlan {
            state: match ours {
                None => JumpState::Absent,
                Some(1) => JumpState::Correct,
                Some(_) => JumpState::Misplaced,
            },
            insert_at: 1,
        },
        JumpPosition::AfterKubeServices => {
            let kube = (rules.iter())
                .filter(|(_, target)| KUBE_CHAINS.contains(&target.as_str()))
                .map(|(num, _)| *num)
                .max()
                .unwrap_or(0);

            match ours {
                None => JumpPlan {
                    state: JumpState::Absent,
                    insert_at: kube + 1,
                },
                Some(num) if num > kube => JumpPlan {
                    state: JumpState::Correct,
                    insert_at: num,
                },
                // deleting ours moves the kube jumps up by one
                Some(_) => JumpPlan {
                    state: JumpState::Misplaced,
                    insert_at: kube,
                },
            }
        }
    }
}

/// Parse `iptables -n -L` for the chains we own.
pub(super) fn parse_owned_chains(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| line.strip_prefix("Chain "))
        .filter_map(|rest| rest.split_whitespace().next())
        .filter(|name| rules::is_owned_chain(name))
        .map(str::to_string)
        .collect()
}
