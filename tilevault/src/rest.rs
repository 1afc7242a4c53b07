use serde::{Deserialize, Serialize};

use crate::array_schema::ArraySchema;
use crate::error::{Error, Result};
use crate::query::Query;
use crate::storage::Uri;

/// URIs with this scheme are routed to the REST client when one is
/// installed.
pub const REST_URI_SCHEME: &str = "tilevault";

/// The wire encoding used between the engine and a REST server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// JSON text encoding.
    #[default]
    Json,
    /// Cap'n Proto binary encoding.
    Capnp,
}

impl std::fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Capnp => write!(f, "capnp"),
        }
    }
}

impl std::str::FromStr for SerializationFormat {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Self::Json),
            "capnp" => Ok(Self::Capnp),
            _ => Err(Error::InvalidArgument(format!(
                "unknown serialization format {s:?}"
            ))),
        }
    }
}

/// The remote-execution boundary.
///
/// When `rest.server_address` is configured and a client is installed,
/// operations on arrays with the [`REST_URI_SCHEME`] scheme are routed here
/// instead of the local storage manager. The contract of every method is
/// identical to its in-process counterpart. A client may transparently
/// resubmit an incomplete read whose server-side result did not fit the
/// response budget, concatenating into the query buffers.
pub trait RestClient: Send + Sync {
    /// Load the schema of a remote array.
    fn get_array_schema(&self, uri: &Uri) -> Result<ArraySchema>;

    /// Submit a query for remote execution.
    fn submit_query(&self, uri: &Uri, query: &mut Query) -> Result<()>;

    /// Finalize a remote query.
    fn finalize_query(&self, uri: &Uri, query: &mut Query) -> Result<()>;

    /// Retrieve the non-empty domain of a remote array.
    fn get_non_empty_domain(&self, uri: &Uri) -> Result<Option<Vec<[i64; 2]>>>;
}
