//! Core types used throughout the system
//!
//! Identifier newtypes shared by the cash-in state machine and the
//! risk-control engine. All of them wrap a UUID so they map 1:1 onto the
//! `uuid` columns of the PostgreSQL store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID (e.g. read back from the store)
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Get the inner UUID value
            pub fn inner(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Cash-in session identifier, assigned by the machine on first bill insertion.
    TxId
);

uuid_id!(
    /// Customer identifier (customer directory primary key)
    CustomerId
);

uuid_id!(
    /// Machine identifier
    DeviceId
);

/// Cryptocurrency ticker as configured on the machine (`BTC`, `ETH`, `USDT`...)
pub type CryptoCode = String;
