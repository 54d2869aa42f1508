//! Property-based tests for dispatcher invariants.

use std::collections::BTreeMap;

use proptest::prelude::*;
use serde_json::Value;

use kb_types::{CommandSource, GlobalFlags, Manifest, RegisteredCommand};

use crate::dispatch::normalize_tokens;
use crate::registry::{Registry, Resolved};

fn manifest(id: &str, package: &str) -> Manifest {
    Manifest {
        id: id.to_string(),
        package: package.to_string(),
        ..Manifest::default()
    }
}

proptest! {
    /// For any `group:name` id, the colon form, the pre-split form, and
    /// the space form all resolve to the same registered command.
    #[test]
    fn path_spellings_resolve_identically(
        group in "[a-z][a-z0-9]{0,6}",
        name in "[a-z][a-z0-9]{0,6}",
    ) {
        let id = format!("{group}:{name}");
        let mut registry = Registry::new();
        registry.register_manifest(RegisteredCommand::new(
            manifest(&id, "@kb/demo"),
            CommandSource::Workspace,
            None,
        ));

        let colon = normalize_tokens(&[id.clone()]);
        let split = vec![group.clone(), name.clone()];

        let via_colon = registry.resolve_path(&colon);
        let via_split = registry.resolve_path(&split);
        let via_space = registry.get(&format!("{group} {name}"));

        for resolved in [
            via_colon.map(|(r, _)| r),
            via_split.map(|(r, _)| r),
            via_space,
        ] {
            match resolved {
                Some(Resolved::Command(cmd)) => prop_assert_eq!(cmd.id(), id.as_str()),
                other => prop_assert!(false, "expected command, got {:?}", other),
            }
        }
    }

    /// Normalization splits exactly when every segment is non-empty.
    #[test]
    fn normalization_splits_iff_segments_are_non_empty(
        segments in prop::collection::vec("[a-z0-9]{0,4}", 2..5),
        rest in prop::collection::vec("[a-z]{1,4}", 0..3),
    ) {
        let first = segments.join(":");
        let mut tokens = vec![first.clone()];
        tokens.extend(rest.iter().cloned());

        let normalized = normalize_tokens(&tokens);
        if segments.iter().all(|s| !s.is_empty()) {
            let mut expected = segments.clone();
            expected.extend(rest.iter().cloned());
            prop_assert_eq!(normalized, expected);
        } else {
            prop_assert_eq!(normalized, tokens);
        }
    }

    /// However many manifests fight over an id, exactly one stays
    /// authoritative and every loser is marked shadowed.
    #[test]
    fn exactly_one_authoritative_manifest_per_id(
        entries in prop::collection::vec(
            ("[ab]:[xy]", "[a-z]{1,5}", 0u8..3u8),
            1..12,
        ),
    ) {
        let mut registry = Registry::new();
        for (id, package, source) in &entries {
            let source = match source {
                0 => CommandSource::Workspace,
                1 => CommandSource::Linked,
                _ => CommandSource::NodeModules,
            };
            registry.register_manifest(RegisteredCommand::new(
                manifest(id, package),
                source,
                None,
            ));
        }

        let mut authoritative: BTreeMap<&str, usize> = BTreeMap::new();
        for rc in registry.list_manifests() {
            prop_assert!(!rc.shadowed);
            *authoritative.entry(rc.id()).or_insert(0) += 1;
        }
        for count in authoritative.values() {
            prop_assert_eq!(*count, 1);
        }

        for rc in registry.shadowed_manifests() {
            prop_assert!(rc.shadowed);
            prop_assert!(authoritative.contains_key(rc.id()));
        }

        let distinct_ids: std::collections::BTreeSet<&str> =
            entries.iter().map(|(id, _, _)| id.as_str()).collect();
        prop_assert_eq!(authoritative.len(), distinct_ids.len());
    }

    /// Merged flags: every provided global appears unchanged, nothing the
    /// user did not provide is introduced, and handler-level flags are
    /// never dropped.
    #[test]
    fn global_flag_merge_is_faithful(
        json in any::<bool>(),
        quiet in any::<bool>(),
        dry_run in any::<bool>(),
        log_level in prop::option::of("[a-z]{3,6}"),
        existing in prop::collection::btree_map("[np-z]{1,6}", 0i64..100, 0..4),
    ) {
        let globals = GlobalFlags {
            json,
            quiet,
            dry_run,
            log_level: log_level.clone(),
            ..GlobalFlags::default()
        };

        let mut flags: BTreeMap<String, Value> = existing
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect();
        globals.merge_into(&mut flags);

        prop_assert_eq!(flags.contains_key("json"), json);
        prop_assert_eq!(flags.contains_key("quiet"), quiet);
        prop_assert_eq!(flags.contains_key("dryRun"), dry_run);
        prop_assert_eq!(flags.contains_key("logLevel"), log_level.is_some());
        prop_assert!(!flags.contains_key("verbose"));

        for (key, value) in &existing {
            prop_assert_eq!(flags.get(key), Some(&Value::from(*value)));
        }
    }
}
