//! Manifest preflight validation.
//!
//! Preflight sits between discovery and registration: each candidate is
//! checked structurally and semantically, in a fixed order, and either
//! passes or is skipped with a stable reason code. Skipped candidates are
//! reported, never registered.

use std::path::Path;

use semver::Version;

use kb_types::{SkipReason, SkippedManifest, is_known_capability, KNOWN_CAPABILITIES};

use crate::discovery::CandidateManifest;

/// Runtime baseline assumed when `KB_NODE_VERSION` is not set. Plugin
/// handlers run out of process, so the host only advertises a baseline
/// rather than inspecting an interpreter.
pub const DEFAULT_RUNTIME_VERSION: &str = "20.11.0";

/// Versions the engine checks compare against.
#[derive(Debug, Clone)]
pub struct PreflightEnv {
    pub host_version: Version,
    pub runtime_version: Version,
}

impl PreflightEnv {
    /// Resolve versions from the process environment. `CLI_VERSION`
    /// overrides the compiled-in host version; `KB_NODE_VERSION` overrides
    /// the runtime baseline. Unparsable overrides fall back.
    pub fn from_process(compiled_version: &str) -> Self {
        let host_version = std::env::var("CLI_VERSION")
            .ok()
            .and_then(|v| Version::parse(&v).ok())
            .or_else(|| Version::parse(compiled_version).ok())
            .unwrap_or_else(|| Version::new(0, 0, 0));

        let runtime_version = std::env::var("KB_NODE_VERSION")
            .ok()
            .and_then(|v| Version::parse(&v).ok())
            .unwrap_or_else(|| {
                Version::parse(DEFAULT_RUNTIME_VERSION).expect("baseline version parses")
            });

        Self {
            host_version,
            runtime_version,
        }
    }
}

/// Outcome of preflighting one candidate.
#[derive(Debug, Clone)]
pub enum PreflightVerdict {
    Valid,
    Skipped(SkippedManifest),
}

impl PreflightVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, PreflightVerdict::Valid)
    }
}

/// Run the preflight checks, in order, stopping at the first failure.
pub fn preflight(candidate: &CandidateManifest, env: &PreflightEnv) -> PreflightVerdict {
    let manifest = &candidate.manifest;

    // 1. id shape
    if manifest.id.is_empty() {
        return skip(candidate, SkipReason::MalformedId, "manifest declares no id", None);
    }
    if manifest.id_segments().iter().any(|s| s.is_empty()) {
        return skip(
            candidate,
            SkipReason::MalformedId,
            &format!("id '{}' contains empty segments", manifest.id),
            None,
        );
    }

    // 2. group consistency
    if let Some(group) = manifest.group.as_deref() {
        if group.is_empty() {
            return skip(
                candidate,
                SkipReason::MalformedId,
                &format!("id '{}' declares an empty group", manifest.id),
                None,
            );
        }
        let segments = manifest.id_segments();
        if segments.len() >= 2 && segments[0] != group {
            return skip(
                candidate,
                SkipReason::MalformedId,
                &format!(
                    "group '{group}' does not match the id prefix '{}'",
                    segments[0]
                ),
                None,
            );
        }
    }

    if let Some(engine) = &manifest.engine {
        // 3. runtime floor (`>=X.Y.Z`, major compare)
        if let Some(required) = engine.node.as_deref().and_then(parse_floor)
            && env.runtime_version.major < required.major
        {
            return skip(
                candidate,
                SkipReason::NodeVersionMismatch,
                &format!(
                    "requires node >={required}, runtime baseline is {}",
                    env.runtime_version
                ),
                Some("upgrade the runtime or set KB_NODE_VERSION"),
            );
        }

        // 4. host compatibility (`^X.Y.Z`, major compare)
        if let Some(required) = engine.kb_cli.as_deref().and_then(parse_caret)
            && env.host_version.major != required.major
        {
            return skip(
                candidate,
                SkipReason::CliVersionMismatch,
                &format!(
                    "requires kb CLI ^{required}, host is {}",
                    env.host_version
                ),
                Some("upgrade the kb CLI or the plugin"),
            );
        }

        // 5. module system
        if let Some(module) = engine.module
            && module != candidate.module_kind
        {
            return skip(
                candidate,
                SkipReason::ModuleTypeMismatch,
                &format!(
                    "manifest expects {} but the package declares {}",
                    module_label(module),
                    module_label(candidate.module_kind)
                ),
                None,
            );
        }
    }

    // 6. peer packages
    for peer in &manifest.requires {
        if !peer_resolvable(&candidate.pkg_root, peer) {
            return skip(
                candidate,
                SkipReason::MissingPeerDep,
                &format!("required peer '{peer}' is not resolvable from the package"),
                Some(&format!("install {peer} in the workspace")),
            );
        }
    }

    // 7. capability names
    for capability in &manifest.permissions {
        if !is_known_capability(capability) {
            return skip(
                candidate,
                SkipReason::UnknownPermission,
                &format!("unknown capability '{capability}'"),
                Some(&format!("known capabilities: {}", KNOWN_CAPABILITIES.join(", "))),
            );
        }
    }

    PreflightVerdict::Valid
}

fn skip(
    candidate: &CandidateManifest,
    reason: SkipReason,
    detail: &str,
    hint: Option<&str>,
) -> PreflightVerdict {
    let manifest = &candidate.manifest;
    PreflightVerdict::Skipped(SkippedManifest {
        id: if manifest.id.is_empty() {
            None
        } else {
            Some(manifest.id.clone())
        },
        package: candidate.package.clone(),
        group: manifest.group_name().map(str::to_string),
        pkg_root: Some(candidate.pkg_root.clone()),
        reason,
        detail: detail.to_string(),
        hint: hint.map(str::to_string),
    })
}

/// Parse a `>=X.Y.Z` floor constraint. Other shapes are not rejected,
/// they simply do not constrain.
fn parse_floor(constraint: &str) -> Option<Version> {
    Version::parse(constraint.strip_prefix(">=")?.trim()).ok()
}

/// Parse a `^X.Y.Z` caret constraint.
fn parse_caret(constraint: &str) -> Option<Version> {
    Version::parse(constraint.strip_prefix('^')?.trim()).ok()
}

fn module_label(kind: kb_types::ModuleKind) -> &'static str {
    match kind {
        kb_types::ModuleKind::Esm => "esm",
        kb_types::ModuleKind::Cjs => "cjs",
    }
}

/// Whether a peer package resolves on the module path: a `node_modules`
/// entry in the package root or any of its ancestors.
fn peer_resolvable(pkg_root: &Path, peer: &str) -> bool {
    for dir in pkg_root.ancestors() {
        let mut candidate = dir.join("node_modules");
        for part in peer.split('/') {
            candidate.push(part);
        }
        if candidate.join("package.json").is_file() {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    use serial_test::serial;
    use tempfile::tempdir;

    use kb_types::{CommandSource, EngineSpec, Manifest, ModuleKind};

    fn env() -> PreflightEnv {
        PreflightEnv {
            host_version: Version::new(1, 5, 0),
            runtime_version: Version::new(20, 11, 0),
        }
    }

    fn candidate(manifest: Manifest) -> CandidateManifest {
        CandidateManifest {
            package: "@kb/demo".to_string(),
            pkg_root: PathBuf::from("/ws/packages/demo"),
            source: CommandSource::Workspace,
            module_kind: ModuleKind::Esm,
            manifest,
        }
    }

    fn manifest(id: &str) -> Manifest {
        Manifest {
            id: id.to_string(),
            package: "@kb/demo".to_string(),
            ..Manifest::default()
        }
    }

    fn expect_skip(verdict: PreflightVerdict, reason: SkipReason) -> SkippedManifest {
        match verdict {
            PreflightVerdict::Skipped(skipped) => {
                assert_eq!(skipped.reason, reason);
                skipped
            }
            PreflightVerdict::Valid => panic!("expected skip with {:?}", reason),
        }
    }

    #[test]
    fn well_formed_manifest_passes() {
        let mut m = manifest("devlink:plan");
        m.engine = Some(EngineSpec {
            node: Some(">=18.0.0".to_string()),
            kb_cli: Some("^1.0.0".to_string()),
            module: Some(ModuleKind::Esm),
        });
        m.permissions = vec!["fs.read".to_string(), "fs.write".to_string()];

        assert!(preflight(&candidate(m), &env()).is_valid());
    }

    #[test]
    fn bare_name_id_is_valid() {
        assert!(preflight(&candidate(manifest("scaffold")), &env()).is_valid());
    }

    #[test]
    fn missing_id_is_malformed() {
        let skipped = expect_skip(
            preflight(&candidate(manifest("")), &env()),
            SkipReason::MalformedId,
        );
        assert!(skipped.id.is_none());
        assert_eq!(skipped.package, "@kb/demo");
    }

    #[test]
    fn empty_segment_is_malformed() {
        expect_skip(
            preflight(&candidate(manifest("devlink:")), &env()),
            SkipReason::MalformedId,
        );
        expect_skip(
            preflight(&candidate(manifest(":plan")), &env()),
            SkipReason::MalformedId,
        );
    }

    #[test]
    fn group_mismatch_is_malformed() {
        let mut m = manifest("devlink:plan");
        m.group = Some("mind".to_string());
        let skipped = expect_skip(preflight(&candidate(m), &env()), SkipReason::MalformedId);
        assert!(skipped.detail.contains("does not match"));
    }

    #[test]
    fn node_floor_blocks_old_runtimes() {
        let mut m = manifest("devlink:plan");
        m.engine = Some(EngineSpec {
            node: Some(">=22.0.0".to_string()),
            ..EngineSpec::default()
        });
        let skipped = expect_skip(
            preflight(&candidate(m), &env()),
            SkipReason::NodeVersionMismatch,
        );
        assert!(skipped.detail.contains(">=22.0.0"));
    }

    #[test]
    fn cli_major_mismatch_is_skipped() {
        let mut m = manifest("devlink:plan");
        m.engine = Some(EngineSpec {
            kb_cli: Some("^2.0.0".to_string()),
            ..EngineSpec::default()
        });
        let skipped = expect_skip(
            preflight(&candidate(m), &env()),
            SkipReason::CliVersionMismatch,
        );
        assert!(skipped.detail.contains("host is 1.5.0"));
        assert_eq!(skipped.group.as_deref(), Some("devlink"));
    }

    #[test]
    fn unrecognized_constraint_shapes_do_not_constrain() {
        let mut m = manifest("devlink:plan");
        m.engine = Some(EngineSpec {
            node: Some("~18.2.0".to_string()),
            kb_cli: Some(">=2.0.0".to_string()),
            ..EngineSpec::default()
        });
        assert!(preflight(&candidate(m), &env()).is_valid());
    }

    #[test]
    fn module_type_mismatch_is_skipped() {
        let mut m = manifest("devlink:plan");
        m.engine = Some(EngineSpec {
            module: Some(ModuleKind::Cjs),
            ..EngineSpec::default()
        });
        let skipped = expect_skip(
            preflight(&candidate(m), &env()),
            SkipReason::ModuleTypeMismatch,
        );
        assert!(skipped.detail.contains("cjs"));
        assert!(skipped.detail.contains("esm"));
    }

    #[test]
    fn missing_peer_is_skipped_and_present_peer_resolves() {
        let td = tempdir().expect("tempdir");
        let pkg_root = td.path().join("packages/demo");
        fs::create_dir_all(&pkg_root).expect("mkdir");

        let mut m = manifest("devlink:plan");
        m.requires = vec!["@kb/core".to_string()];
        let mut c = candidate(m);
        c.pkg_root = pkg_root.clone();

        expect_skip(preflight(&c, &env()), SkipReason::MissingPeerDep);

        // Hoisted install at the workspace root satisfies the peer.
        let hoisted = td.path().join("node_modules/@kb/core");
        fs::create_dir_all(&hoisted).expect("mkdir");
        fs::write(hoisted.join("package.json"), r#"{"name": "@kb/core"}"#).expect("write");
        assert!(preflight(&c, &env()).is_valid());
    }

    #[test]
    fn unknown_permission_is_skipped() {
        let mut m = manifest("devlink:plan");
        m.permissions = vec!["fs.read".to_string(), "gpu.compute".to_string()];
        let skipped = expect_skip(
            preflight(&candidate(m), &env()),
            SkipReason::UnknownPermission,
        );
        assert!(skipped.detail.contains("gpu.compute"));
        assert!(skipped.hint.expect("hint").contains("fs.write"));
    }

    #[test]
    fn checks_apply_in_order() {
        // Malformed id is reported even when later checks would also fail.
        let mut m = manifest("devlink:");
        m.permissions = vec!["gpu.compute".to_string()];
        expect_skip(preflight(&candidate(m), &env()), SkipReason::MalformedId);
    }

    #[test]
    #[serial]
    fn env_overrides_resolve_versions() {
        temp_env::with_vars(
            [
                ("CLI_VERSION", Some("2.3.4")),
                ("KB_NODE_VERSION", Some("22.1.0")),
            ],
            || {
                let env = PreflightEnv::from_process("0.4.0");
                assert_eq!(env.host_version, Version::new(2, 3, 4));
                assert_eq!(env.runtime_version, Version::new(22, 1, 0));
            },
        );
    }

    #[test]
    #[serial]
    fn unparsable_env_overrides_fall_back() {
        temp_env::with_vars(
            [
                ("CLI_VERSION", Some("not-a-version")),
                ("KB_NODE_VERSION", None::<&str>),
            ],
            || {
                let env = PreflightEnv::from_process("0.4.0");
                assert_eq!(env.host_version, Version::new(0, 4, 0));
                assert_eq!(
                    env.runtime_version,
                    Version::parse(DEFAULT_RUNTIME_VERSION).expect("parse")
                );
            },
        );
    }
}
