use itertools::Itertools;

use super::{Acl, Direction, MatchType, NetworkPolicy, Ports, Protocol, SetInfo, Verdict};

pub const MAIN_CHAIN: &str = "KNPD";
pub const INGRESS_CHAIN: &str = "KNPD-INGRESS";
pub const INGRESS_ALLOW_MARK_CHAIN: &str = "KNPD-INGRESS-ALLOW-MARK";
pub const EGRESS_CHAIN: &str = "KNPD-EGRESS";
pub const ACCEPT_CHAIN: &str = "KNPD-ACCEPT";

/// Chains existing regardless of policies.
pub const SKELETON_CHAINS: [&str; 5] = [
    MAIN_CHAIN,
    INGRESS_CHAIN,
    INGRESS_ALLOW_MARK_CHAIN,
    EGRESS_CHAIN,
    ACCEPT_CHAIN,
];

pub const INGRESS_DROP_MARK: &str = "0x4000";
pub const EGRESS_DROP_MARK: &str = "0x5000";
pub const ALLOW_MARK: &str = "0x2000";
pub const CLEAR_MARK: &str = "0x0";

/// Rule spec of the jump from FORWARD into [`MAIN_CHAIN`].
pub const FORWARD_JUMP: &str = "-j KNPD -m conntrack --ctstate NEW";

/// iptables refuses longer comments.
const MAX_COMMENT_LEN: usize = 256;

/// Rules of the skeleton chains, as `(chain, spec)` in append order.
pub fn skeleton_rules() -> Vec<(&'static str, String)> {
    vec![
        (MAIN_CHAIN, format!("-j {INGRESS_CHAIN}")),
        (MAIN_CHAIN, format!("-j {EGRESS_CHAIN}")),
        (MAIN_CHAIN, format!("-j {ACCEPT_CHAIN}")),
        (
            INGRESS_CHAIN,
            format!(
                "-j DROP -m mark --mark {INGRESS_DROP_MARK} -m comment --comment DROP-ON-INGRESS-DROP-MARK-{INGRESS_DROP_MARK}"
            ),
        ),
        (
            INGRESS_ALLOW_MARK_CHAIN,
            format!(
                "-j MARK --set-mark {ALLOW_MARK} -m comment --comment SET-INGRESS-ALLOW-MARK-{ALLOW_MARK}"
            ),
        ),
        (INGRESS_ALLOW_MARK_CHAIN, format!("-j {EGRESS_CHAIN}")),
        (
            EGRESS_CHAIN,
            format!(
                "-j DROP -m mark --mark {EGRESS_DROP_MARK} -m comment --comment DROP-ON-EGRESS-DROP-MARK-{EGRESS_DROP_MARK}"
            ),
        ),
        (
            EGRESS_CHAIN,
            format!(
                "-j {ACCEPT_CHAIN} -m mark --mark {ALLOW_MARK} -m comment --comment ACCEPT-ON-INGRESS-ALLOW-MARK-{ALLOW_MARK}"
            ),
        ),
        (
            ACCEPT_CHAIN,
            format!("-j MARK --set-mark {CLEAR_MARK} -m comment --comment CLEAR-KNPD-MARKS"),
        ),
        (ACCEPT_CHAIN, "-j ACCEPT".to_string()),
    ]
}

fn target(verdict: Verdict, direction: Direction) -> String {
    match (verdict, direction) {
        (Verdict::Allow, Direction::Egress) => format!("-j {ACCEPT_CHAIN}"),
        (Verdict::Allow, _) => format!("-j {INGRESS_ALLOW_MARK_CHAIN}"),
        (Verdict::Drop, Direction::Egress) => format!("-j MARK --set-mark {EGRESS_DROP_MARK}"),
        (Verdict::Drop, _) => format!("-j MARK --set-mark {INGRESS_DROP_MARK}"),
    }
}

fn protocol(protocol: Protocol) -> Option<&'static str> {
    match protocol {
        Protocol::Tcp => Some("TCP"),
        Protocol::Udp => Some("UDP"),
        Protocol::Sctp => Some("SCTP"),
        Protocol::Unspecified => None,
    }
}

fn ports(ports: &Ports) -> String {
    if ports.end_port == 0 || ports.end_port == ports.port {
        ports.port.to_string()
    } else {
        format!("{}:{}", ports.port, ports.end_port)
    }
}

/// `-m set [!] --match-set <set> <axis>`, `either` being the axis of `MatchType::Either`.
fn match_set(info: &SetInfo, either: &str) -> String {
    let axis = match info.match_type {
        MatchType::Src => "src",
        MatchType::Dst => "dst",
        MatchType::Both => "dst,dst",
        MatchType::Either => either,
    };
    let not = if info.included { "" } else { "! " };
    format!(
        "-m set {not}--match-set {} {axis}",
        info.set.hashed_name()
    )
}

fn set_names(list: &[SetInfo]) -> String {
    list.iter()
        .map(|info| {
            let not = if info.included { "" } else { "!" };
            format!("{not}{}", info.set.prefixed_name())
        })
        .join("-AND-")
}

fn comment(text: String) -> String {
    let mut text: String = text.split_whitespace().join("-");
    if text.len() > MAX_COMMENT_LEN {
        let mut end = MAX_COMMENT_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    format!("-m comment --comment {text}")
}

fn acl_comment(acl: &Acl) -> String {
    let mut text = match acl.verdict {
        Verdict::Allow => "ALLOW".to_string(),
        Verdict::Drop => "DROP".to_string(),
    };
    if !acl.src_list.is_empty() {
        text.push_str("-FROM-");
        text.push_str(&set_names(&acl.src_list));
    }
    if !acl.dst_list.is_empty() {
        text.push_str("-TO-");
        text.push_str(&set_names(&acl.dst_list));
    }
    if acl.src_list.is_empty() && acl.dst_list.is_empty() {
        text.push_str("-ALL");
    }
    if let Some(proto) = protocol(acl.protocol) {
        text.push_str("-ON-");
        text.push_str(proto);
    }
    if let Some(p) = &acl.dst_ports {
        text.push_str("-TO-PORT-");
        text.push_str(&ports(p));
    }
    text
}

/// Rule spec (without `-A <chain>`) of an ACL in the chain of the given direction.
pub fn acl_rule(acl: &Acl, direction: Direction) -> String {
    let mut parts = vec![target(acl.verdict, direction)];
    if let Some(proto) = protocol(acl.protocol) {
        parts.push(format!("-p {proto}"));
    }
    if let Some(p) = &acl.src_ports {
        parts.push(format!("--sport {}", ports(p)));
    }
    if let Some(p) = &acl.dst_ports {
        parts.push(format!("--dport {}", ports(p)));
    }
    parts.extend(acl.src_list.iter().map(|info| match_set(info, "src")));
    parts.extend(acl.dst_list.iter().map(|info| match_set(info, "dst")));
    parts.push(comment(acl_comment(acl)));
    parts.join(" ")
}

/// Rule spec of the jump from the ingress or egress chain into the policy's chain.
pub fn jump_rule(policy: &NetworkPolicy, direction: Direction) -> String {
    let (chain, either, label, preposition) = match direction {
        Direction::Egress => (policy.egress_chain(), "src", "EGRESS", "FROM"),
        _ => (policy.ingress_chain(), "dst", "INGRESS", "TO"),
    };

    let mut parts = vec![format!("-j {chain}")];
    parts.extend(
        (policy.pod_selector_list.iter()).map(|info| match_set(info, either)),
    );

    let selected = if policy.pod_selector_list.is_empty() {
        "all".to_string()
    } else {
        set_names(&policy.pod_selector_list)
    };
    parts.push(comment(format!(
        "{label}-POLICY-{}-{preposition}-{selected}-IN-ns-{}",
        policy.key(),
        policy.namespace
    )));
    parts.join(" ")
}

/// Chain of the given direction in the dispatch chain.
pub fn dispatch_chain(direction: Direction) -> &'static str {
    match direction {
        Direction::Egress => EGRESS_CHAIN,
        _ => INGRESS_CHAIN,
    }
}

/// Whether the chain name is one of ours.
pub fn is_owned_chain(name: &str) -> bool {
    name == MAIN_CHAIN || name.starts_with("KNPD-")
}
