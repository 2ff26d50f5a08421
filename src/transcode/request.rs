use std::{
    fmt::Display,
    path::{Component, Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;
use tracing::warn;

use super::{Delivery, OutputFormat, QualityTier, UnknownVariant};
use crate::{config::Config, error::ConvertError};

/// What to do with a query value that isn't one of the known variants.
/// Absent values always take the default.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Default)]
pub enum ParamPolicy {
    /// Answer 400 naming the field.
    #[default]
    Reject,
    /// Log a warning and use the default.
    Fallback,
}

impl FromStr for ParamPolicy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "fallback" => Ok(Self::Fallback),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

/// Raw query string of the convert endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConvertQuery {
    pub format: Option<String>,
    pub quality: Option<String>,
    pub delivery: Option<String>,
    pub input: Option<String>,
}

/// One conversion, built per request and dropped once the response is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub input_path: PathBuf,
    pub format: OutputFormat,
    pub quality: QualityTier,
}

impl ConvertQuery {
    pub fn resolve(self, config: &Config) -> Result<(ConversionRequest, Delivery), ConvertError> {
        let input = self.input.unwrap_or_else(|| config.input_file.clone());
        let input = input.trim();
        if input.is_empty() {
            return Err(ConvertError::MissingInput);
        }
        if !is_plain_file_name(input) {
            return Err(ConvertError::InvalidParameter {
                field: "input",
                reason: format!("'{}' is not a plain file name", input),
            });
        }

        let policy = config.param_policy;
        let request = ConversionRequest {
            input_path: config.input_dir.join(input),
            format: pick("format", self.format, policy, OutputFormat::default())?,
            quality: pick("quality", self.quality, policy, QualityTier::default())?,
        };
        let delivery = pick("delivery", self.delivery, policy, config.delivery)?;

        Ok((request, delivery))
    }
}

fn pick<T>(
    field: &'static str,
    raw: Option<String>,
    policy: ParamPolicy,
    default: T,
) -> Result<T, ConvertError>
where
    T: FromStr<Err = UnknownVariant> + Display,
{
    let value = match raw.as_deref().map(str::trim) {
        // `format=` is treated the same as no format at all
        None | Some("") => return Ok(default),
        Some(value) => value,
    };

    match value.parse() {
        Ok(parsed) => Ok(parsed),
        Err(err) => match policy {
            ParamPolicy::Reject => Err(ConvertError::InvalidParameter {
                field,
                reason: err.to_string(),
            }),
            ParamPolicy::Fallback => {
                warn!("unrecognized {} '{}', using {}", field, value, default);
                Ok(default)
            }
        },
    }
}

/// Exactly one normal path component, no separators of either flavor.
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}
