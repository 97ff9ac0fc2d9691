//! Serializable distribution descriptions
//!
//! A [`DistributionSpec`] travels with every I/O request so the target can
//! rebuild the same mapping the client used.

use crate::simple::DEFAULT_STRIP_SIZE;
use crate::{Basic, DistError, Distribution, Result, SimpleStripe, VarStrip, parse_size};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// Named distribution plus its parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionSpec {
    /// Round-robin fixed-size strips
    SimpleStripe {
        /// Strip size in bytes
        strip_size: u64,
    },
    /// Explicit strip list, `target:size;...`
    Varstrip {
        /// Strip list
        strips: String,
    },
    /// Whole file on the first target
    Basic,
}

impl Default for DistributionSpec {
    fn default() -> Self {
        Self::SimpleStripe {
            strip_size: DEFAULT_STRIP_SIZE,
        }
    }
}

impl DistributionSpec {
    /// Instantiate the strategy
    pub fn build(&self) -> Result<Arc<dyn Distribution>> {
        let dist: Arc<dyn Distribution> = match self {
            Self::SimpleStripe { strip_size } => Arc::new(SimpleStripe::new(*strip_size)?),
            Self::Varstrip { strips } => match strips.parse::<VarStrip>() {
                Ok(varstrip) => Arc::new(varstrip),
                Err(e) => {
                    debug!(strips = %strips, error = %e, "rejected strip list");
                    return Err(e);
                }
            },
            Self::Basic => Arc::new(Basic),
        };
        trace!(name = dist.name(), "built distribution");
        Ok(dist)
    }

    /// Parse `simple_stripe[:size]`, `varstrip:<strips>` or `basic`
    pub fn parse(value: &str) -> Result<Self> {
        let (name, params) = match value.split_once(':') {
            Some((name, params)) => (name.trim(), Some(params.trim())),
            None => (value.trim(), None),
        };
        let spec = match (name, params) {
            ("simple_stripe", None) => Self::default(),
            ("simple_stripe", Some(size)) => Self::SimpleStripe {
                strip_size: parse_size("strip_size", size)?,
            },
            ("varstrip", Some(strips)) => Self::Varstrip {
                strips: strips.to_string(),
            },
            ("basic", None) => Self::Basic,
            ("varstrip", None) => {
                return Err(DistError::InvalidParameter {
                    name: "strips".to_string(),
                    message: "varstrip needs a strip list".to_string(),
                });
            }
            (other, _) => return Err(DistError::Unknown(other.to_string())),
        };
        spec.build()?;
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_specs() {
        assert_eq!(
            DistributionSpec::parse("simple_stripe").unwrap(),
            DistributionSpec::default()
        );
        assert_eq!(
            DistributionSpec::parse("simple_stripe:4K").unwrap(),
            DistributionSpec::SimpleStripe { strip_size: 4096 }
        );
        let var = DistributionSpec::parse("varstrip:0:100;1:200").unwrap();
        assert_eq!(var.build().unwrap().name(), "varstrip");
        assert_eq!(DistributionSpec::parse("basic").unwrap(), DistributionSpec::Basic);
        assert_eq!(DistributionSpec::Basic.build().unwrap().name(), "basic");
    }

    #[test]
    fn test_parse_rejects_bad_specs() {
        assert!(matches!(
            DistributionSpec::parse("twod"),
            Err(DistError::Unknown(_))
        ));
        assert!(DistributionSpec::parse("varstrip").is_err());
        assert!(DistributionSpec::parse("varstrip:0:0").is_err());
        assert!(DistributionSpec::parse("simple_stripe:0").is_err());
        assert!(DistributionSpec::parse("basic:4K").is_err());
    }

    #[test]
    fn test_spec_survives_msgpack() {
        let spec = DistributionSpec::Varstrip {
            strips: "0:10;1:20".to_string(),
        };
        let bytes = rmp_serde::to_vec_named(&spec).unwrap();
        let back: DistributionSpec = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, spec);
    }
}
