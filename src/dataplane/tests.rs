use super::*;
use crate::backend::recorder::{Call, CallKind};
use crate::backend::{Output, Recorder, Tool};
use crate::policies::{Acl, Direction, MatchType, SetInfo, Verdict};

fn dataplane() -> (Arc<Recorder>, Dataplane) {
    let backend = Arc::new(Recorder::new());
    let dp = Dataplane::new(backend.clone(), &Config::default());
    (backend, dp)
}

fn ns(name: &str) -> SetMetadata {
    SetMetadata::new(name, SetType::Namespace)
}

/// Allow all ingress traffic to the pods of the selector set.
fn selecting(name: &str, selector: &SetMetadata) -> NetworkPolicy {
    let mut policy = NetworkPolicy::new("x", name);
    policy.pod_selector_sets = vec![TranslatedSet::new(selector.clone())];
    policy.pod_selector_list = vec![SetInfo::new(selector.clone(), true, MatchType::Either)];

    let mut acl = Acl::new(Verdict::Allow, Direction::Ingress);
    acl.dst_list = vec![SetInfo::new(selector.clone(), true, MatchType::Either)];
    policy.acls = vec![acl];
    policy
}

fn lines<'a>(batch: &'a str, prefix: &str) -> Vec<&'a str> {
    batch.lines().filter(|l| l.starts_with(prefix)).collect()
}

#[test]
fn add_policy_programs_sets_then_chains() {
    let (backend, dp) = dataplane();
    let default = ns("default");
    dp.create_sets(&[default.clone()]);
    dp.add_to_sets(&[default.clone()], "10.0.0.5", "podA").unwrap();

    dp.add_policy(&selecting("allow-all", &default)).unwrap();

    let calls = backend.calls();
    assert!(matches!(calls[0], Call::Restore { tool: Tool::IpSet, .. }));
    assert!(matches!(calls[1], Call::Restore { tool: Tool::IpTables, .. }));

    let hashed = default.hashed_name();
    let sets = backend.batches(Tool::IpSet);
    assert_eq!(sets.len(), 1);
    assert_eq!(lines(&sets[0], "-N "), vec![format!("-N {hashed} -exist nethash")]);
    assert_eq!(lines(&sets[0], "-A "), vec![format!("-A {hashed} 10.0.0.5")]);

    let rules = backend.batches(Tool::IpTables);
    assert_eq!(rules.len(), 1);
    assert_eq!(lines(&rules[0], ":").len(), 2);
    let acls = lines(&rules[0], "-A ");
    assert_eq!(acls.len(), 1);
    assert!(acls[0].contains(&format!("--match-set {hashed} dst")));
    assert_eq!(lines(&rules[0], "-I ").len(), 1);

    assert!(dp.policies().is_registered("x/allow-all"));
    let metrics = dp.metrics().snapshot();
    assert_eq!(metrics.policies, 1);
    assert_eq!(metrics.kernel_sets, 1);
}

#[test]
fn shared_selector_set_outlives_one_policy() {
    let (backend, dp) = dataplane();
    let default = ns("default");
    dp.create_sets(&[default.clone()]);
    dp.add_to_sets(&[default.clone()], "10.0.0.5", "podA").unwrap();
    let first = selecting("allow-all", &default);
    dp.add_policy(&first).unwrap();
    dp.add_policy(&selecting("other", &default)).unwrap();
    backend.take_calls();

    dp.remove_policy("x/allow-all").unwrap();
    let rules = backend.batches(Tool::IpTables);
    assert_eq!(rules.len(), 1);
    assert_eq!(lines(&rules[0], "-D KNPD-INGRESS ").len(), 1);
    assert!(rules[0].contains(&format!("-F {}", first.ingress_chain())));

    let destroy = format!("-X {}", default.hashed_name());
    assert!(backend.batches(Tool::IpSet).iter().all(|b| !b.contains(&destroy)));
    assert!(!dp.policies().is_registered("x/allow-all"));

    // the last user gone, the set leaves the kernel but keeps its pod
    backend.take_calls();
    dp.remove_policy("x/other").unwrap();
    let sets = backend.batches(Tool::IpSet);
    assert_eq!(sets.len(), 1);
    assert!(sets[0].contains(&destroy));
    assert!(dp.ipsets().exists("ns-default"));
}

#[test]
fn removing_unknown_policy_is_a_no_op() {
    let (backend, dp) = dataplane();
    dp.remove_policy("x/missing").unwrap();
    assert!(backend.calls().is_empty());
}

#[test]
fn update_policy_replaces_only_on_change() {
    let (backend, dp) = dataplane();
    let default = ns("default");
    let policy = selecting("p", &default);
    dp.update_policy(&policy).unwrap();
    assert!(dp.policies().is_registered("x/p"));
    backend.take_calls();

    dp.update_policy(&policy.clone()).unwrap();
    assert!(backend.calls().is_empty());

    let mut changed = policy.clone();
    changed.acls[0].verdict = Verdict::Drop;
    dp.update_policy(&changed).unwrap();
    let rules = backend.batches(Tool::IpTables);
    assert_eq!(rules.len(), 2);
    assert!(rules[0].contains("-D KNPD-INGRESS"));
    assert!(rules[1].contains("-j MARK --set-mark 0x4000"));
    assert_eq!(dp.policies().get_policy("x/p"), Some(changed));

    let set = dp.ipsets().get("ns-default").unwrap();
    assert_eq!(set.selector_refs(), 1);
}

#[test]
fn failed_add_releases_sets() {
    let (backend, dp) = dataplane();
    let default = ns("default");
    backend.script(
        CallKind::Restore,
        Tool::IpTables,
        Output::failed(1, "iptables-restore: line 2 failed"),
    );

    let err = dp.add_policy(&selecting("p", &default));
    assert!(matches!(err, Err(Error::Policies(_))));
    assert!(!dp.policies().is_registered("x/p"));
    // released and deleted from the cache, destroyed by the next apply
    assert!(!dp.ipsets().exists("ns-default"));
    assert!(dp.ipsets().dirty().to_delete.contains("ns-default"));

    backend.take_calls();
    dp.apply_dataplane().unwrap();
    let sets = backend.batches(Tool::IpSet);
    assert!(sets[0].contains(&format!("-X {}", default.hashed_name())));
}

#[test]
fn policy_cidr_sets() {
    let (backend, dp) = dataplane();
    let block = SetMetadata::new("x-p-in-0", SetType::CidrBlocks);
    let mut policy = selecting("p", &ns("default"));
    let mut cidr = TranslatedSet::new(block.clone());
    cidr.members = vec!["10.1.0.0/16".to_string()];
    policy.rule_sets = vec![cidr];
    policy.acls[0].src_list = vec![SetInfo::new(block.clone(), true, MatchType::Src)];

    dp.add_policy(&policy).unwrap();
    let hashed = block.hashed_name();
    let sets = backend.batches(Tool::IpSet);
    assert!(sets[0].contains(&format!("-N {hashed} -exist nethash maxelem 4294967295\n")));
    assert!(sets[0].contains(&format!("-A {hashed} 10.1.0.0/16\n")));

    backend.take_calls();
    dp.remove_policy("x/p").unwrap();
    assert!(!dp.ipsets().exists("cidr-x-p-in-0"));
    assert!(backend.batches(Tool::IpSet)[0].contains(&format!("-X {hashed}")));
}

#[test]
fn invalid_cidr_fails_the_add() {
    let (backend, dp) = dataplane();
    let mut policy = selecting("p", &ns("default"));
    let mut cidr = TranslatedSet::new(SetMetadata::new("bad", SetType::CidrBlocks));
    cidr.members = vec!["not-a-cidr".to_string()];
    policy.rule_sets = vec![cidr];

    let err = dp.add_policy(&policy);
    assert!(matches!(
        err,
        Err(Error::IpSets(ipsets::Error::InvalidMember { .. }))
    ));
    assert!(backend.calls().is_empty());
    assert!(!dp.ipsets().exists("ns-default"));
    assert!(!dp.ipsets().exists("cidr-bad"));
}

#[test]
fn policy_nested_lists() {
    let (backend, dp) = dataplane();
    let nested = SetMetadata::new("app:web:db", SetType::NestedLabelOfPod);
    let member = SetMetadata::new("app:web", SetType::KeyValueLabelOfPod);
    let mut policy = selecting("p", &ns("default"));
    let mut list = TranslatedSet::new(nested.clone());
    list.members = vec!["app:web".to_string()];
    policy.rule_sets = vec![list];

    dp.add_policy(&policy).unwrap();
    let member_set = dp.ipsets().get("podlabel-app:web").unwrap();
    assert_eq!(member_set.list_refs(), 1);
    assert_eq!(member_set.kernel_refs(), 1);

    let sets = backend.batches(Tool::IpSet);
    assert!(sets[0].contains(&format!("-N {} -exist setlist\n", nested.hashed_name())));
    assert!(sets[0].contains(&format!("-N {} -exist nethash\n", member.hashed_name())));
    assert!(sets[0].contains(&format!(
        "-A {} {}\n",
        nested.hashed_name(),
        member.hashed_name()
    )));

    // same policy again: the members are already there
    let mut again = policy.clone();
    again.name = "q".to_string();
    dp.add_policy(&again).unwrap();
    assert_eq!(dp.ipsets().get("podlabel-app:web").unwrap().list_refs(), 1);

    dp.remove_policy("x/p").unwrap();
    assert!(dp.ipsets().exists("nestedlabel-app:web:db"));
    dp.remove_policy("x/q").unwrap();
    assert!(!dp.ipsets().exists("nestedlabel-app:web:db"));
    assert!(!dp.ipsets().exists("podlabel-app:web"));
}

#[test]
fn apply_retries_stale_chains() {
    let (backend, dp) = dataplane();
    let policy = selecting("p", &ns("default"));
    dp.add_policy(&policy).unwrap();
    backend.take_calls();

    // line 5 destroys the ingress chain
    backend.script(
        CallKind::Restore,
        Tool::IpTables,
        Output::failed(1, "iptables-restore: line 5 failed: Device or resource busy"),
    );
    dp.remove_policy("x/p").unwrap();
    assert_eq!(dp.policies().stale_chains(), vec![policy.ingress_chain()]);

    backend.take_calls();
    dp.apply_dataplane().unwrap();
    let chain = policy.ingress_chain();
    assert_eq!(
        backend.batches(Tool::IpTables),
        vec![format!("*filter\n-F {chain}\n-X {chain}\nCOMMIT\n")]
    );
    assert!(dp.policies().stale_chains().is_empty());
}

#[test]
fn delete_set_keeps_used_sets() {
    let (_, dp) = dataplane();
    let default = ns("default");
    dp.create_sets(&[default.clone()]);
    dp.add_to_sets(&[default.clone()], "10.0.0.5", "podA").unwrap();

    dp.delete_set(&default).unwrap();
    assert!(dp.ipsets().exists("ns-default"));

    dp.remove_from_sets(&[default.clone()], "10.0.0.5", "podA").unwrap();
    dp.delete_set(&default).unwrap();
    assert!(!dp.ipsets().exists("ns-default"));
}

#[test]
fn bootup_resets_then_initializes() {
    let (backend, dp) = dataplane();
    backend.script(
        CallKind::Exec,
        Tool::IpTables,
        Output::failed(1, "iptables: Bad rule (does a matching rule exist in that chain?)."),
    );
    dp.bootup().unwrap();

    let calls = backend.calls();
    let execs: Vec<(Tool, String)> = (calls.iter())
        .filter_map(|call| match call {
            Call::Exec { tool, args } => Some((*tool, args.join(" "))),
            _ => None,
        })
        .collect();
    assert_eq!(
        execs,
        vec![
            (Tool::IpTables, "-D FORWARD -j KNPD -m conntrack --ctstate NEW".to_string()),
            (Tool::IpTables, "-t filter -n -L".to_string()),
            (Tool::IpSet, "list --name".to_string()),
            (Tool::IpTables, "-t filter -n -L FORWARD --line-numbers".to_string()),
            (Tool::IpTables, "-I FORWARD 1 -j KNPD -m conntrack --ctstate NEW".to_string()),
        ]
    );
    let rules = backend.batches(Tool::IpTables);
    assert_eq!(rules.len(), 1);
    assert!(rules[0].starts_with("*filter\n:KNPD - -\n"));
}

#[test]
fn config_defaults() {
    let config: Config = serde_yaml::from_str("{}").unwrap();
    assert_eq!(config, Config::default());
    assert_eq!(config.lock_wait, 60);
    assert_eq!(config.apply_max_tries, 2);

    let config: Config =
        serde_yaml::from_str("jump_position: first\ndialect: legacy\n").unwrap();
    assert_eq!(config.jump_position, JumpPosition::First);
    assert_eq!(config.dialect, Some(Dialect::Legacy));
}
