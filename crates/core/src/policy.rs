//! Run, error and pull policies.
//!
//! The policies are small closed sets, represented as enums and marshaled
//! through explicit tag tables so the serialized form is stable regardless
//! of future variant reordering.

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

/// RunPolicy defines the policy for starting containers based on the
/// point-in-time pass or fail state of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPolicy {
    #[default]
    OnSuccess,
    OnFailure,
    Always,
    Never,
}

impl RunPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnSuccess => "on-success",
            Self::OnFailure => "on-failure",
            Self::Always => "always",
            Self::Never => "never",
        }
    }

    /// Looks up the tag. Unknown or empty tags resolve to the default.
    pub fn from_tag(s: &str) -> Self {
        match s {
            "on-failure" => Self::OnFailure,
            "always" => Self::Always,
            "never" => Self::Never,
            _ => Self::OnSuccess,
        }
    }
}

/// ErrPolicy defines how a non-zero step exit affects the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrPolicy {
    #[default]
    Fail,
    FailFast,
    Ignore,
}

impl ErrPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::FailFast => "fail-fast",
            Self::Ignore => "ignore",
        }
    }

    pub fn from_tag(s: &str) -> Self {
        match s {
            "fail-fast" | "fast-fail" | "fast" => Self::FailFast,
            "ignore" => Self::Ignore,
            _ => Self::Fail,
        }
    }
}

/// PullPolicy defines the container image pull policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    #[default]
    Default,
    Always,
    IfNotExists,
    Never,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Always => "always",
            Self::IfNotExists => "if-not-exists",
            Self::Never => "never",
        }
    }

    pub fn from_tag(s: &str) -> Self {
        match s {
            "always" => Self::Always,
            "if-not-exists" | "if-not-present" => Self::IfNotExists,
            "never" => Self::Never,
            _ => Self::Default,
        }
    }
}

macro_rules! policy_serde {
    ($ty:ident) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self::from_tag(s))
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
                s.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                Ok(Self::from_tag(&s))
            }
        }
    };
}

policy_serde!(RunPolicy);
policy_serde!(ErrPolicy);
policy_serde!(PullPolicy);
