//! Entity identifiers.
//!
//! Identifiers are database-assigned integers. Runner ids are significant
//! beyond identity: for a given pipeline the deploy runner with the largest id
//! is the latest one, so the wrappers keep `Ord`.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
            From,
        )]
        #[serde(transparent)]
        #[display("{_0}")]
        pub struct $name(pub i64);

        impl $name {
            /// Get the raw integer value.
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

entity_id!(
    /// A CD pipeline (one app deployed to one environment).
    PipelineId
);
entity_id!(
    /// An immutable image reference produced by CI or a stage plugin.
    ArtifactId
);
entity_id!(
    /// A CD workflow grouping the pre, deploy and post runners of one deployment.
    WorkflowId
);
entity_id!(
    /// One execution of one stage.
    RunnerId
);
entity_id!(
    /// A frozen release record.
    OverrideId
);
entity_id!(
    /// An image path reservation.
    ReservationId
);
