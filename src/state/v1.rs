//! Version 1 of the state file.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::attrs::clearance::{Clearance, EquivalencyEntry};
use crate::attrs::CountryCode;
use crate::bundle::{BundlePointer, VersionCursor};
use crate::center::{rebuild_trusted_issuers, Center};
use crate::federation::{FederatedResource, SyncResult};
use crate::spoke::{SpokeRecord, SpokeToken};
use crate::trust::TrustEdge;

//----------- Spec -------------------------------------------------------------

/// A state file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Spec {
    /// Known spokes.
    pub spokes: Vec<SpokeRecord>,

    /// Live spoke tokens.  Expired ones are dropped on load.
    #[serde(default)]
    pub spoke_tokens: Vec<SpokeToken>,

    /// The bilateral trust graph.
    #[serde(default)]
    pub trust_edges: Vec<TrustEdge>,

    /// The clearance equivalency vocabularies.
    #[serde(default)]
    pub clearance: BTreeMap<CountryCode, BTreeMap<Clearance, EquivalencyEntry>>,

    /// The federated resource catalog.
    #[serde(default)]
    pub resources: Vec<FederatedResource>,

    /// Recent federation sync results.
    #[serde(default)]
    pub sync_log: Vec<SyncResult>,

    /// The bundle version sequence cursor.
    #[serde(default)]
    pub bundle_cursor: VersionCursor,

    /// The current bundle pointer.
    #[serde(default)]
    pub current_bundle: Option<BundlePointer>,
}

//--- Conversion

impl Spec {
    /// Parse from this specification.
    pub fn parse_into(self, center: &Arc<Center>) {
        center.spokes.replace_all(self.spokes, self.spoke_tokens);
        center.trust.replace_all(self.trust_edges);

        for (country, entries) in self.clearance {
            if let Err(err) = center.clearance.replace_country(country, entries) {
                // Keep the seeded vocabulary for that country instead of
                // loading a broken one.
                error!("Ignoring persisted clearance vocabulary for {country}: {err}");
            }
        }

        center.resources.replace_all(self.resources, self.sync_log);

        {
            let mut bundles = center.bundles.lock().unwrap();
            bundles.cursor = self.bundle_cursor;
            bundles.current = self.current_bundle.clone();
        }
        center
            .current_bundle
            .store(self.current_bundle.map(Arc::new));

        rebuild_trusted_issuers(center);
    }

    /// Build this state specification.
    pub fn build(center: &Arc<Center>) -> Self {
        let (spokes, spoke_tokens) = center.spokes.snapshot();
        let (resources, sync_log) = center.resources.snapshot();
        let (bundle_cursor, current_bundle) = {
            let bundles = center.bundles.lock().unwrap();
            (bundles.cursor, bundles.current.clone())
        };

        Self {
            spokes,
            spoke_tokens,
            trust_edges: center.trust.edges(),
            clearance: center.clearance.snapshot(),
            resources,
            sync_log,
            bundle_cursor,
            current_bundle,
        }
    }
}

//============ Tests ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state;

    #[test]
    fn spec_round_trips_through_json() {
        let spec = state::Spec::V1(Spec {
            spokes: Vec::new(),
            spoke_tokens: Vec::new(),
            trust_edges: Vec::new(),
            clearance: BTreeMap::new(),
            resources: Vec::new(),
            sync_log: Vec::new(),
            bundle_cursor: VersionCursor::default(),
            current_bundle: None,
        });

        let json = serde_json::to_value(&spec).unwrap();
        assert_json_diff::assert_json_include!(
            actual: &json,
            expected: serde_json::json!({ "version": "v1", "spokes": [] })
        );

        let parsed: state::Spec = serde_json::from_value(json).unwrap();
        let state::Spec::V1(parsed) = parsed;
        assert!(parsed.spokes.is_empty());
        assert_eq!(parsed.bundle_cursor, VersionCursor::default());
    }

    #[test]
    fn spec_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(tmp.path().join("state.db")).unwrap();

        let spec = state::Spec::V1(Spec {
            spokes: Vec::new(),
            spoke_tokens: Vec::new(),
            trust_edges: Vec::new(),
            clearance: BTreeMap::new(),
            resources: Vec::new(),
            sync_log: Vec::new(),
            bundle_cursor: VersionCursor {
                day: Some("2026-08-01".parse().unwrap()),
                seq: 7,
            },
            current_bundle: None,
        });
        spec.save(&path).unwrap();

        let state::Spec::V1(loaded) = state::Spec::load(&path).unwrap();
        assert_eq!(loaded.bundle_cursor.seq, 7);
    }
}
