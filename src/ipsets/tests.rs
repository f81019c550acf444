use super::*;
use crate::backend::recorder::CallKind;
use crate::backend::{Output, Recorder, Tool};
use crate::metrics::Metrics;
use std::sync::Arc;

fn ns(name: &str) -> SetMetadata {
    SetMetadata::new(name, SetType::Namespace)
}

fn ns_label(name: &str) -> SetMetadata {
    SetMetadata::new(name, SetType::KeyLabelOfNamespace)
}

fn cache_with(sets: &[&SetMetadata]) -> Cache {
    let mut cache = Cache::new();
    for set in sets {
        cache.create_set(set);
    }
    cache
}

fn names(sets: &[&SetMetadata]) -> Vec<String> {
    sets.iter().map(|s| s.prefixed_name()).collect()
}

fn manager() -> (Arc<Recorder>, IpSetManager) {
    let backend = Arc::new(Recorder::new());
    let mgr = IpSetManager::new(backend.clone(), Arc::new(Metrics::new()), 2);
    (backend, mgr)
}

fn strs(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[test]
fn metadata_names() {
    let set = ns("default");
    assert_eq!(set.prefixed_name(), "ns-default");
    assert_eq!(set.hashed_name(), crate::hash::set_name("ns-default"));
    assert_eq!(
        SetMetadata::new("app:web", SetType::KeyValueLabelOfPod).prefixed_name(),
        "podlabel-app:web"
    );
    assert_eq!(SetType::CidrBlocks.kernel_spec(), "nethash maxelem 4294967295");
    assert_eq!(SetType::NestedLabelOfPod.kernel_spec(), "setlist");
    assert_eq!(SetType::NamedPorts.kernel_spec(), "hash:ip,port");
}

#[test]
fn create_is_idempotent() {
    let default = ns("default");
    let mut cache = cache_with(&[&default]);
    cache
        .add_member(&names(&[&default]), "10.0.0.5", "podA")
        .unwrap();
    cache
        .add_reference("ns-default", "x/p", ReferenceKind::Selector)
        .unwrap();
    let before = cache.get("ns-default").cloned();
    let dirty = cache.dirty().clone();

    cache.create_set(&default);
    assert_eq!(cache.get("ns-default").cloned(), before);
    assert_eq!(cache.dirty(), &dirty);
    assert_eq!(cache.len(), 1);
}

#[test]
fn member_errors() {
    let default = ns("default");
    let list = ns_label("team");
    let mut cache = cache_with(&[&default, &list]);

    assert!(matches!(
        cache.add_member(&strs(&["ns-missing"]), "10.0.0.1", "a"),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        cache.add_member(&strs(&["nslabel-team"]), "10.0.0.1", "a"),
        Err(Error::WrongKind { .. })
    ));
    assert!(matches!(
        cache.add_member(&strs(&["ns-default"]), "not-an-ip", "a"),
        Err(Error::InvalidMember { .. })
    ));
    // nothing was added to the valid set of a failed call
    assert!(matches!(
        cache.add_member(&strs(&["ns-default", "ns-missing"]), "10.0.0.1", "a"),
        Err(Error::NotFound(_))
    ));
    assert_eq!(cache.get("ns-default").unwrap().member_count(), 0);
}

#[test]
fn owner_reassignment_and_stale_removal() {
    let default = ns("default");
    let mut cache = cache_with(&[&default]);
    let sets = names(&[&default]);

    cache.add_member(&sets, "10.0.0.5", "podA").unwrap();
    cache.add_member(&sets, "10.0.0.5", "podB").unwrap();
    let set = cache.get("ns-default").unwrap();
    assert_eq!(set.ip_members().unwrap()["10.0.0.5"], "podB");

    // podA is gone, but the IP now belongs to podB
    cache.remove_member(&sets, "10.0.0.5", "podA").unwrap();
    assert_eq!(cache.get("ns-default").unwrap().member_count(), 1);

    cache.remove_member(&sets, "10.0.0.5", "podB").unwrap();
    assert_eq!(cache.get("ns-default").unwrap().member_count(), 0);

    // removing an absent member is fine
    cache.remove_member(&sets, "10.0.0.5", "podB").unwrap();
}

#[test]
fn list_contract_errors() {
    let a = ns("a");
    let team = ns_label("team");
    let other = ns_label("other");
    let mut cache = cache_with(&[&a, &team, &other]);

    assert!(matches!(
        cache.add_to_list("ns-a", &strs(&["ns-a"])),
        Err(Error::WrongKind { .. })
    ));
    assert!(matches!(
        cache.add_to_list("nslabel-team", &strs(&["nslabel-team"])),
        Err(Error::SelfMembership(_))
    ));
    assert!(matches!(
        cache.add_to_list("nslabel-team", &strs(&["nslabel-other"])),
        Err(Error::NestedList(_))
    ));
    assert!(matches!(
        cache.add_to_list("nslabel-team", &strs(&["ns-missing"])),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        cache.remove_from_list("nslabel-team", &strs(&["ns-a"])),
        Err(Error::NotMember { .. })
    ));

    cache.add_to_list("nslabel-team", &strs(&["ns-a"])).unwrap();
    assert!(matches!(
        cache.add_to_list("nslabel-team", &strs(&["ns-a"])),
        Err(Error::AlreadyMember { .. })
    ));
}

#[test]
fn list_round_trip_restores_counts() {
    let a = ns("a");
    let team = ns_label("team");
    let mut cache = cache_with(&[&a, &team]);
    cache
        .add_reference("nslabel-team", "x/p", ReferenceKind::NetPol)
        .unwrap();

    let before = cache.get("ns-a").cloned().unwrap();
    cache.add_to_list("nslabel-team", &strs(&["ns-a"])).unwrap();
    let during = cache.get("ns-a").unwrap();
    assert_eq!(during.list_refs(), 1);
    assert_eq!(during.kernel_refs(), 1);
    assert!(during.should_be_in_kernel());

    cache
        .remove_from_list("nslabel-team", &strs(&["ns-a"]))
        .unwrap();
    let after = cache.get("ns-a").unwrap();
    assert_eq!(after.list_refs(), before.list_refs());
    assert_eq!(after.kernel_refs(), before.kernel_refs());
    assert!(!after.should_be_in_kernel());
}

#[test]
fn kernel_presence_is_transitive() {
    let a = ns("a");
    let b = ns("b");
    let team = ns_label("team");
    let mut cache = cache_with(&[&a, &b, &team]);
    cache
        .add_to_list("nslabel-team", &strs(&["ns-a", "ns-b"]))
        .unwrap();

    // a list outside the kernel does not pull its members in
    assert!(!cache.get("ns-a").unwrap().should_be_in_kernel());
    assert!(cache.dirty().is_empty());

    cache
        .add_reference("nslabel-team", "x/p", ReferenceKind::NetPol)
        .unwrap();
    for name in ["nslabel-team", "ns-a", "ns-b"] {
        assert!(cache.get(name).unwrap().should_be_in_kernel(), "{name}");
        assert!(cache.dirty().to_add_or_update.contains(name), "{name}");
    }

    // b is also selected directly: it stays when the list goes
    cache
        .add_reference("ns-b", "x/q", ReferenceKind::Selector)
        .unwrap();
    cache
        .delete_reference("nslabel-team", "x/p", ReferenceKind::NetPol)
        .unwrap();
    assert!(!cache.get("nslabel-team").unwrap().should_be_in_kernel());
    assert!(!cache.get("ns-a").unwrap().should_be_in_kernel());
    assert!(cache.get("ns-b").unwrap().should_be_in_kernel());

    // never applied: leaving the kernel needs no kernel command
    assert!(cache.dirty().to_delete.is_empty());
    assert_eq!(cache.dirty().to_add_or_update, Set::from(["ns-b".to_string()]));
}

#[test]
fn references_are_per_owner() {
    let a = ns("a");
    let mut cache = cache_with(&[&a]);
    cache.add_reference("ns-a", "x/p", ReferenceKind::Selector).unwrap();
    cache.add_reference("ns-a", "x/p", ReferenceKind::Selector).unwrap();
    cache.add_reference("ns-a", "x/q", ReferenceKind::Selector).unwrap();
    let set = cache.get("ns-a").unwrap();
    assert_eq!(set.selector_refs(), 2);
    assert!(set.is_referenced_by("x/p", ReferenceKind::Selector));
    assert!(!set.is_referenced_by("x/p", ReferenceKind::NetPol));

    assert!(matches!(
        cache.add_reference("ns-missing", "x/p", ReferenceKind::Selector),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn deletability() {
    let a = ns("a");
    let team = ns_label("team");
    let mut cache = cache_with(&[&a, &team]);
    cache.add_reference("ns-a", "x/p", ReferenceKind::Selector).unwrap();
    cache.add_reference("ns-a", "x/p", ReferenceKind::NetPol).unwrap();
    cache.add_to_list("nslabel-team", &strs(&["ns-a"])).unwrap();

    assert!(matches!(cache.delete_set("ns-a"), Err(Error::NotDeletable(_))));
    cache
        .delete_reference("ns-a", "x/p", ReferenceKind::Selector)
        .unwrap();
    cache
        .delete_reference("ns-a", "x/p", ReferenceKind::NetPol)
        .unwrap();
    assert!(matches!(cache.delete_set("ns-a"), Err(Error::NotDeletable(_))));
    cache
        .remove_from_list("nslabel-team", &strs(&["ns-a"]))
        .unwrap();

    cache.add_member(&strs(&["ns-a"]), "10.0.0.1", "pod").unwrap();
    assert!(matches!(cache.delete_set("ns-a"), Err(Error::NotDeletable(_))));
    cache.remove_member(&strs(&["ns-a"]), "10.0.0.1", "pod").unwrap();

    cache.delete_set("ns-a").unwrap();
    assert!(!cache.exists("ns-a"));
    assert!(cache.dirty().is_empty());
}

#[test]
fn apply_creates_and_fills() {
    let (backend, mgr) = manager();
    let default = ns("default");
    mgr.create_sets(&[default.clone()]);
    mgr.add_to_sets(&[default.clone()], "10.0.0.5", "podA")
        .unwrap();

    // not referenced: nothing to do in the kernel
    mgr.apply().unwrap();
    assert!(backend.calls().is_empty());

    mgr.add_reference(&default, "x/p", ReferenceKind::Selector)
        .unwrap();
    mgr.apply().unwrap();

    let h = default.hashed_name();
    assert_eq!(
        backend.batches(Tool::IpSet),
        vec![format!("-N {h} -exist nethash\n-A {h} 10.0.0.5\n")]
    );
    assert!(mgr.dirty().is_empty());

    // only the diff is sent on update
    backend.take_calls();
    mgr.add_to_sets(&[default.clone()], "10.0.0.6", "podB")
        .unwrap();
    mgr.remove_from_sets(&[default.clone()], "10.0.0.5", "podA")
        .unwrap();
    mgr.apply().unwrap();
    assert_eq!(
        backend.batches(Tool::IpSet),
        vec![format!(
            "-N {h} -exist nethash\n-D {h} 10.0.0.5\n-A {h} 10.0.0.6\n"
        )]
    );
}

#[test]
fn apply_lists_and_deletes() {
    let (backend, mgr) = manager();
    let a = ns("a");
    let team = ns_label("team");
    let cidr = SetMetadata::new("x-p-in-0", SetType::CidrBlocks);
    mgr.create_sets(&[a.clone(), team.clone(), cidr.clone()]);
    mgr.add_to_lists(&[team.clone()], &[a.clone()]).unwrap();
    mgr.add_to_sets(&[cidr.clone()], "10.1.0.0/16", "").unwrap();
    mgr.add_reference(&team, "x/p", ReferenceKind::NetPol)
        .unwrap();
    mgr.add_reference(&cidr, "x/p", ReferenceKind::NetPol)
        .unwrap();
    mgr.apply().unwrap();

    let (ha, hteam, hcidr) = (a.hashed_name(), team.hashed_name(), cidr.hashed_name());
    let batch = &backend.batches(Tool::IpSet)[0];
    for line in [
        format!("-N {ha} -exist nethash"),
        format!("-N {hteam} -exist setlist"),
        format!("-N {hcidr} -exist nethash maxelem 4294967295"),
        format!("-A {hteam} {ha}"),
        format!("-A {hcidr} 10.1.0.0/16"),
    ] {
        assert!(batch.lines().any(|l| l == line), "missing {line} in\n{batch}");
    }

    // creations come before the list references them
    let pos = |needle: &str| batch.find(needle).unwrap();
    assert!(pos(&format!("-N {ha}")) < pos(&format!("-A {hteam}")));

    backend.take_calls();
    mgr.delete_reference(&team, "x/p", ReferenceKind::NetPol)
        .unwrap();
    mgr.delete_reference(&cidr, "x/p", ReferenceKind::NetPol)
        .unwrap();
    let dirty = mgr.dirty();
    assert_eq!(dirty.to_delete.len(), 3);
    assert!(dirty.to_add_or_update.is_empty());

    mgr.apply().unwrap();
    let batch = &backend.batches(Tool::IpSet)[0];
    let lines: Vec<_> = batch.lines().collect();
    assert_eq!(lines.len(), 6);
    assert!(lines[..3].iter().all(|l| l.starts_with("-F ")));
    assert!(lines[3..].iter().all(|l| l.starts_with("-X ")));
    assert!(mgr.dirty().is_empty());
}

#[test]
fn already_exists_on_create_succeeds() {
    let (backend, mgr) = manager();
    let default = ns("default");
    mgr.create_sets(&[default.clone()]);
    mgr.add_to_sets(&[default.clone()], "10.0.0.5", "podA")
        .unwrap();
    mgr.add_reference(&default, "x/p", ReferenceKind::Selector)
        .unwrap();

    backend.script(
        CallKind::Restore,
        Tool::IpSet,
        Output::failed(
            1,
            "Error in line 1: Set cannot be created: set with the same name already exists",
        ),
    );
    mgr.apply().unwrap();
    assert!(mgr.dirty().is_empty());
    assert_eq!(backend.calls().len(), 2);
}

#[test]
fn in_use_stays_dirty() {
    let (backend, mgr) = manager();
    let default = ns("default");
    mgr.create_sets(&[default.clone()]);
    mgr.add_reference(&default, "x/p", ReferenceKind::Selector)
        .unwrap();
    mgr.apply().unwrap();

    mgr.delete_reference(&default, "x/p", ReferenceKind::Selector)
        .unwrap();
    backend.script(
        CallKind::Restore,
        Tool::IpSet,
        Output::failed(
            1,
            "Error in line 2: Set cannot be destroyed: it is in use by a kernel component",
        ),
    );
    let err = mgr.apply().unwrap_err();
    assert!(matches!(err, Error::InUse(ref names) if names == &["ns-default".to_string()]));
    assert!(mgr.dirty().to_delete.contains("ns-default"));

    // next apply retries the destroy
    backend.take_calls();
    mgr.apply().unwrap();
    let h = default.hashed_name();
    assert_eq!(
        backend.batches(Tool::IpSet),
        vec![format!("-F {h}\n-X {h}\n")]
    );
    assert!(mgr.dirty().is_empty());
}

#[test]
fn readmitted_after_deferred_destroy_is_refilled() {
    let (backend, mgr) = manager();
    let default = ns("default");
    mgr.create_sets(&[default.clone()]);
    mgr.add_to_sets(&[default.clone()], "10.0.0.5", "podA")
        .unwrap();
    mgr.add_reference(&default, "x/p", ReferenceKind::Selector)
        .unwrap();
    mgr.apply().unwrap();

    // the flush on line 1 ran, the destroy on line 2 was refused
    mgr.delete_reference(&default, "x/p", ReferenceKind::Selector)
        .unwrap();
    backend.script(
        CallKind::Restore,
        Tool::IpSet,
        Output::failed(
            1,
            "Error in line 2: Set cannot be destroyed: it is in use by a kernel component",
        ),
    );
    assert!(matches!(mgr.apply(), Err(Error::InUse(_))));

    backend.take_calls();
    mgr.add_reference(&default, "x/q", ReferenceKind::Selector)
        .unwrap();
    mgr.apply().unwrap();
    let h = default.hashed_name();
    assert_eq!(
        backend.batches(Tool::IpSet),
        vec![format!("-N {h} -exist nethash\n-F {h}\n-A {h} 10.0.0.5\n")]
    );
    assert!(mgr.dirty().is_empty());
}

#[test]
fn failed_update_is_rebuilt() {
    let (backend, mgr) = manager();
    let default = ns("default");
    mgr.create_sets(&[default.clone()]);
    mgr.add_to_sets(&[default.clone()], "10.0.0.5", "podA")
        .unwrap();
    mgr.add_reference(&default, "x/p", ReferenceKind::Selector)
        .unwrap();

    backend.script(
        CallKind::Restore,
        Tool::IpSet,
        Output::failed(1, "Error in line 2: Kernel error received: Invalid argument"),
    );
    assert!(matches!(mgr.apply(), Err(Error::Apply(_))));
    assert!(mgr.dirty().to_add_or_update.contains("ns-default"));

    backend.take_calls();
    mgr.apply().unwrap();
    let h = default.hashed_name();
    assert_eq!(
        backend.batches(Tool::IpSet),
        vec![format!("-N {h} -exist nethash\n-F {h}\n-A {h} 10.0.0.5\n")]
    );
}

#[test]
fn reset_destroys_our_sets() {
    let (backend, mgr) = manager();
    mgr.create_sets(&[ns("default")]);
    backend.script(
        CallKind::Exec,
        Tool::IpSet,
        Output::ok("knpd-0000000001\nKUBE-SVC-SOMETHING\nknpd-0000000002\n"),
    );
    mgr.reset().unwrap();
    assert!(!mgr.exists("ns-default"));
    assert_eq!(
        backend.batches(Tool::IpSet),
        vec![
            "-F knpd-0000000001\n-F knpd-0000000002\n-X knpd-0000000001\n-X knpd-0000000002\n"
                .to_string()
        ]
    );
}
