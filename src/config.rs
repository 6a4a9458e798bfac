// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Datastore configuration.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Configuration handed to [`crate::datastore::Datastore::init`] and passed
/// through to the persistent store.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Connection URI for the persistent store.
    pub persistent_uri: String,
    /// Optional path to workload definitions seeded on first start.
    #[serde(default)]
    pub init_workloads_path: Option<Utf8PathBuf>,
}

impl Config {
    pub fn new(persistent_uri: &str) -> Config {
        Config {
            persistent_uri: persistent_uri.to_owned(),
            init_workloads_path: None,
        }
    }
}
