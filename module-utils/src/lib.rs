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

//! # Module helpers
//!
//! This crate contains some helpers that are useful when building Pingora modules such as
//! `cache-sync-module`: the [`RequestFilter`] trait implemented by handlers, configuration
//! loading via [`FromYaml`] and the [`merge_conf`] and [`merge_opt`] macros combining
//! configuration structures and command line options of several components.

mod deserialize;
pub mod pingora;
pub mod standard_response;

pub use deserialize::OneOrMany;

use async_trait::async_trait;
use log::trace;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use std::fmt::Debug;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::pingora::{Error, ErrorType, Session};

/// Request filter result indicating how the current request should be processed further
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RequestFilterResult {
    /// Response has been sent, no further processing should happen. Other Pingora phases should
    /// not be triggered.
    ResponseSent,

    /// Request has been handled and further request filters should not run. Response hasn’t been
    /// sent however, next Pingora phase should deal with that.
    Handled,

    /// Request filter could not handle this request, next request filter should run if it exists.
    #[default]
    Unhandled,
}

/// Trait to be implemented by request filters.
#[async_trait]
pub trait RequestFilter {
    /// Configuration type of this handler.
    type Conf;

    /// Per-request state of this handler, see [`ProxyHttp::CTX`](crate::pingora::ProxyHttp::CTX)
    type CTX;

    /// Creates a new instance of the handler from its configuration.
    fn new(conf: Self::Conf) -> Result<Self, Box<Error>>
    where
        Self: Sized,
        Self::Conf: TryInto<Self, Error = Box<Error>>,
    {
        conf.try_into()
    }

    /// Creates a new state object, see
    /// [`ProxyHttp::new_ctx`](crate::pingora::ProxyHttp::new_ctx)
    fn new_ctx() -> Self::CTX;

    /// Handles the current request.
    ///
    /// This is essentially identical to the `request_filter` method but is supposed to be called
    /// when there is only a single handler. Consequently, its result can be returned directly.
    async fn handle(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool, Box<Error>>
    where
        Self::CTX: Send,
    {
        let result = self.request_filter(session, ctx).await?;
        Ok(result == RequestFilterResult::ResponseSent)
    }

    /// Handler to run during Pingora’s `request_filter` state, see
    /// [`ProxyHttp::request_filter`](crate::pingora::ProxyHttp::request_filter). This uses a
    /// different return type to account for the existence of multiple request filters.
    async fn request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<RequestFilterResult, Box<Error>>;
}

/// Trait for configuration structures that can be loaded from YAML files. This trait has a blanket
/// implementation for any structure implementing [`serde::Deserialize`].
pub trait FromYaml {
    /// Loads configuration from a YAML string.
    fn from_yaml(yaml: impl AsRef<str>) -> Result<Self, Box<Error>>
    where
        Self: Sized;

    /// Loads configuration from a YAML file.
    fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, Box<Error>>
    where
        Self: Sized;

    /// Loads configuration from multiple YAML files. Top-level settings of files listed later
    /// override those of earlier files, nested mappings are merged.
    fn load_from_files<P>(files: impl IntoIterator<Item = P>) -> Result<Self, Box<Error>>
    where
        P: AsRef<Path>,
        Self: Sized;
}

fn read_yaml(path: &Path) -> Result<Value, Box<Error>> {
    let file = File::open(path).map_err(|err| {
        Error::because(
            ErrorType::FileOpenError,
            format!("failed opening configuration file {path:?}"),
            err,
        )
    })?;
    let reader = BufReader::new(file);

    serde_yaml::from_reader(reader).map_err(|err| {
        Error::because(
            ErrorType::FileReadError,
            format!("failed reading configuration file {path:?}"),
            err,
        )
    })
}

fn merge_values(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Mapping(target), Value::Mapping(source)) => {
            for (key, value) in source {
                if let Some(existing) = target.get_mut(&key) {
                    merge_values(existing, value);
                } else {
                    target.insert(key, value);
                }
            }
        }
        (target, source) => *target = source,
    }
}

fn deserialize_value<D: DeserializeOwned + Debug>(value: Value) -> Result<D, Box<Error>> {
    let conf = serde_yaml::from_value(value).map_err(|err| {
        Error::because(
            ErrorType::FileReadError,
            "failed deserializing configuration",
            err,
        )
    })?;
    trace!("Loaded configuration: {conf:#?}");
    Ok(conf)
}

impl<D> FromYaml for D
where
    D: DeserializeOwned + Debug,
{
    fn from_yaml(yaml: impl AsRef<str>) -> Result<Self, Box<Error>> {
        let value = serde_yaml::from_str(yaml.as_ref()).map_err(|err| {
            Error::because(ErrorType::ReadError, "failed parsing configuration", err)
        })?;
        deserialize_value(value)
    }

    fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, Box<Error>> {
        deserialize_value(read_yaml(path.as_ref())?)
    }

    fn load_from_files<P>(files: impl IntoIterator<Item = P>) -> Result<Self, Box<Error>>
    where
        P: AsRef<Path>,
    {
        let mut merged = Value::Mapping(Mapping::new());
        for path in files {
            merge_values(&mut merged, read_yaml(path.as_ref())?);
        }
        deserialize_value(merged)
    }
}

/// This macro merges multiple structures implementing `clap::Args` into a structure containing
/// all of them while making certain that all command line flags can be used.
///
/// *Note*: Support for `struct` syntax is limited when it comes to generics.
///
/// ```rust
/// use clap::Parser;
/// use module_utils::merge_opt;
///
/// #[derive(Debug, Parser)]
/// struct MyAppOpt {
///     /// IP address and port for the server to listen on
///     #[clap(long, default_value = "127.0.0.1:8080")]
///     listen: String,
/// }
///
/// #[derive(Debug, Parser)]
/// struct OtherOpt {
///     /// Enables the other component
///     #[clap(long)]
///     other: bool,
/// }
///
/// merge_opt!{
///     /// Starts my great application.
///     struct Opt {
///         app: MyAppOpt,
///         other: OtherOpt,
///     }
/// }
///
/// let opt = Opt::parse_from(["app", "--other"]);
/// assert!(opt.other.other);
/// assert_eq!(opt.app.listen, "127.0.0.1:8080");
/// ```
#[macro_export]
macro_rules! merge_opt {
    (
        $(#[$struct_attr:meta])*
        $struct_vis:vis struct $struct_name:ident
        {
            $(
                $(#[$field_attr:meta])*
                $field_vis:vis $field_name:ident: $field_type:ty,
            )*
        }
    ) => {
        $(#[$struct_attr])*
        #[derive(::std::fmt::Debug, ::clap::Parser)]
        $struct_vis struct $struct_name
        {
            $(
                #[clap(flatten)]
                $(#[$field_attr])*
                $field_vis $field_name: $field_type,
            )*
        }
    }
}

/// This macro merges multiple structures implementing [`serde::Deserialize`] and [`Default`] into
/// a structure containing all of them.
///
/// The structure of the expected configuration file is flattened, so that the configuration
/// settings from each component are still expected to be found on the top level.
///
/// *Note*: Support for `struct` syntax is limited when it comes to generics.
///
/// ```rust
/// use module_utils::{merge_conf, FromYaml};
/// use serde::Deserialize;
///
/// #[derive(Debug, Default, Deserialize)]
/// #[serde(default)]
/// struct MyAppConf {
///     /// IP address and port for the server to listen on
///     listen: String,
/// }
///
/// #[derive(Debug, Default, Deserialize)]
/// #[serde(default)]
/// struct OtherConf {
///     other: bool,
/// }
///
/// merge_conf!{
///     struct Conf {
///         app: MyAppConf,
///         other: OtherConf,
///     }
/// }
///
/// let conf = Conf::from_yaml("listen: 127.0.0.1:8080\nother: true").unwrap();
/// assert_eq!(conf.app.listen, "127.0.0.1:8080");
/// assert!(conf.other.other);
/// ```
#[macro_export]
macro_rules! merge_conf {
    (
        $(#[$struct_attr:meta])*
        $struct_vis:vis struct $struct_name:ident
        {
            $(
                $(#[$field_attr:meta])*
                $field_vis:vis $field_name:ident: $field_type:ty,
            )*
        }
    ) => {
        $(#[$struct_attr])*
        #[derive(::std::fmt::Debug, ::std::default::Default, ::serde::Deserialize)]
        #[serde(default)]
        $struct_vis struct $struct_name
        {
            $(
                #[serde(flatten)]
                $(#[$field_attr])*
                $field_vis $field_name: $field_type,
            )*
        }
    }
}
