//! The global state file.
//!
//! The hub's durable state is a versioned JSON spec written atomically next
//! to the bundle artifact store.  The spec is a plain data mirror of the
//! live registries; loading replaces registry contents wholesale.

use std::io;
use std::sync::Arc;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::center::Center;
use crate::util::write_file;

pub mod v1;

//----------- Spec -------------------------------------------------------------

/// A versioned state file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "version")]
pub enum Spec {
    /// The version 1 format.
    V1(v1::Spec),
}

impl Spec {
    /// Load the state file.
    pub fn load(path: &Utf8Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    /// Save the state file atomically.
    pub fn save(&self, path: &Utf8Path) -> io::Result<()> {
        let mut text = serde_json::to_vec_pretty(self)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        text.push(b'\n');
        write_file(path, &text)
    }

    /// Build this state specification from the live registries.
    pub fn build(center: &Arc<Center>) -> Self {
        Self::V1(v1::Spec::build(center))
    }

    /// Parse into the live registries.
    pub fn parse_into(self, center: &Arc<Center>) {
        match self {
            Self::V1(spec) => spec.parse_into(center),
        }
    }
}
