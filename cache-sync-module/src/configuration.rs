// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Data structures required for `CacheSyncHandler` configuration

use clap::Parser;
use module_utils::OneOrMany;
use serde::Deserialize;
use std::path::PathBuf;

use crate::agent::UnknownEntryPolicy;
use crate::registry::DEFAULT_CAPACITY;

/// Command line options of the cache sync module
#[derive(Debug, Default, Parser)]
pub struct CacheSyncOpt {
    /// The root directory.
    #[clap(short, long)]
    pub root: Option<PathBuf>,

    /// Index file to look for when displaying a directory. This command line flag can be specified
    /// multiple times.
    #[clap(long)]
    pub index_file: Option<Vec<String>>,

    /// URI path of the proxy relay for cross-origin resources.
    #[clap(long)]
    pub proxy_path: Option<String>,

    /// URI path the cache agent script is served under.
    #[clap(long)]
    pub agent_path: Option<String>,

    /// Request header enabling page rewriting when set to `true`.
    #[clap(long)]
    pub enable_header: Option<String>,

    /// Seconds between two revalidation sweeps of remote ETags.
    #[clap(long)]
    pub revalidate_interval: Option<u64>,

    /// Timeout in seconds for each revalidation request.
    #[clap(long)]
    pub revalidate_timeout: Option<u64>,

    /// Maximal number of entries in the ETag registry.
    #[clap(long)]
    pub registry_capacity: Option<usize>,

    /// What the cache agent does with cached responses missing from the manifest.
    #[clap(long, value_enum)]
    pub unknown_entry_policy: Option<UnknownEntryPolicy>,
}

/// Configuration file settings of the cache sync module
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSyncConf {
    /// The root directory.
    pub root: Option<PathBuf>,

    /// List of index files to look for in a directory.
    pub index_file: OneOrMany<String>,

    /// URI path of the proxy relay for cross-origin resources.
    pub proxy_path: String,

    /// URI path the cache agent script is served under.
    pub agent_path: String,

    /// Request header enabling page rewriting when set to `true`.
    pub enable_header: String,

    /// Seconds between two revalidation sweeps of remote ETags.
    pub revalidate_interval: u64,

    /// Timeout in seconds for each revalidation request.
    pub revalidate_timeout: u64,

    /// Maximal number of entries in the ETag registry.
    pub registry_capacity: usize,

    /// What the cache agent does with cached responses missing from the manifest.
    pub unknown_entry_policy: UnknownEntryPolicy,
}

impl CacheSyncConf {
    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub fn merge_with_opt(&mut self, opt: CacheSyncOpt) {
        if opt.root.is_some() {
            self.root = opt.root;
        }

        if let Some(index_file) = opt.index_file {
            self.index_file = index_file.into();
        }

        if let Some(proxy_path) = opt.proxy_path {
            self.proxy_path = proxy_path;
        }

        if let Some(agent_path) = opt.agent_path {
            self.agent_path = agent_path;
        }

        if let Some(enable_header) = opt.enable_header {
            self.enable_header = enable_header;
        }

        if let Some(revalidate_interval) = opt.revalidate_interval {
            self.revalidate_interval = revalidate_interval;
        }

        if let Some(revalidate_timeout) = opt.revalidate_timeout {
            self.revalidate_timeout = revalidate_timeout;
        }

        if let Some(registry_capacity) = opt.registry_capacity {
            self.registry_capacity = registry_capacity;
        }

        if let Some(unknown_entry_policy) = opt.unknown_entry_policy {
            self.unknown_entry_policy = unknown_entry_policy;
        }
    }
}

impl Default for CacheSyncConf {
    fn default() -> Self {
        Self {
            root: None,
            index_file: vec!["index.html".to_owned()].into(),
            proxy_path: "/proxy-resource".to_owned(),
            agent_path: "/sw.js".to_owned(),
            enable_header: "X-CacheV2-Extension-Enabled".to_owned(),
            revalidate_interval: 600,
            revalidate_timeout: 10,
            registry_capacity: DEFAULT_CAPACITY,
            unknown_entry_policy: UnknownEntryPolicy::Serve,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use module_utils::FromYaml;

    #[test]
    fn defaults() {
        let conf = CacheSyncConf::from_yaml("root: /var/www").unwrap();
        assert_eq!(conf.root, Some(PathBuf::from("/var/www")));
        assert_eq!(
            conf,
            CacheSyncConf {
                root: Some(PathBuf::from("/var/www")),
                ..Default::default()
            }
        );
        assert_eq!(conf.index_file.as_slice(), ["index.html".to_owned()]);
        assert_eq!(conf.revalidate_interval, 600);
    }

    #[test]
    fn yaml_settings() {
        let conf = CacheSyncConf::from_yaml(
            "index_file: default.htm\n\
            proxy_path: /relay\n\
            revalidate_timeout: 3\n\
            registry_capacity: 50\n\
            unknown_entry_policy: revalidate\n",
        )
        .unwrap();
        assert_eq!(conf.index_file.as_slice(), ["default.htm".to_owned()]);
        assert_eq!(conf.proxy_path, "/relay");
        assert_eq!(conf.revalidate_timeout, 3);
        assert_eq!(conf.registry_capacity, 50);
        assert_eq!(conf.unknown_entry_policy, UnknownEntryPolicy::Revalidate);

        assert!(CacheSyncConf::from_yaml("unknown_entry_policy: always").is_err());
    }

    #[test]
    fn command_line_wins() {
        let mut conf = CacheSyncConf::from_yaml("root: /var/www\nagent_path: /agent.js").unwrap();
        let opt = CacheSyncOpt::parse_from([
            "test",
            "--root",
            "/srv",
            "--index-file",
            "a.html",
            "--index-file",
            "b.html",
            "--unknown-entry-policy",
            "revalidate",
        ]);
        conf.merge_with_opt(opt);

        assert_eq!(conf.root, Some(PathBuf::from("/srv")));
        assert_eq!(
            conf.index_file.as_slice(),
            ["a.html".to_owned(), "b.html".to_owned()]
        );
        assert_eq!(conf.agent_path, "/agent.js");
        assert_eq!(conf.unknown_entry_policy, UnknownEntryPolicy::Revalidate);
    }
}
