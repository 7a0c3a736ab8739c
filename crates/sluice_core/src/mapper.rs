//! Contracts for the user-supplied channel-mapper and validator
//! functions.
//!
//! The functions themselves run in an external sandboxed evaluator;
//! the core sees them only through these traits. Evaluator failures
//! are reclassified as HTTP 500 by the write path.

use crate::body::Body;
use crate::channels::{channel_set_from_array, AccessMap, ChannelSet, StarMode};
use crate::error::CoreResult;
use serde_json::{json, Value};

/// What the channel mapper decided about one revision.
#[derive(Debug, Clone, Default)]
pub struct MapperOutput {
    /// Channels the revision belongs to.
    pub channels: ChannelSet,
    /// Channels the document grants to principals.
    pub access: AccessMap,
    /// Rejection verdict: `(status, message)` with status >= 300.
    pub rejection: Option<(u16, String)>,
}

/// An evaluator failure (as opposed to a rejection verdict).
#[derive(Debug, thiserror::Error)]
#[error("evaluator error: {message}")]
pub struct EvaluatorError {
    /// Description of the failure.
    pub message: String,
}

impl EvaluatorError {
    /// Creates an evaluator error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Maps a revision to channels and access grants.
///
/// `new_json` and `old_json` are the serialized new revision body and
/// parent revision body (`old_json` empty when there is no parent);
/// `user_ctx` describes the requesting user.
pub trait ChannelMapper: Send + Sync {
    /// Runs the mapping function over one revision.
    fn map_to_channels_and_access(
        &self,
        new_json: &str,
        old_json: &str,
        user_ctx: &Value,
    ) -> Result<MapperOutput, EvaluatorError>;
}

/// Validates a revision before it is committed.
pub trait Validator: Send + Sync {
    /// Returns `(status, message)`; any status >= 300 rejects the
    /// write with that status.
    fn validate(
        &self,
        new_json: &str,
        old_json: &str,
        user_ctx: &Value,
    ) -> Result<(u16, Option<String>), EvaluatorError>;
}

/// The mapper used when no mapping function is configured: channels
/// are the string items of the body's `channels` property (non-strings
/// ignored, `*` kept), access is empty.
#[derive(Debug, Default)]
pub struct DefaultChannelMapper;

impl DefaultChannelMapper {
    /// Creates the default mapper.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ChannelMapper for DefaultChannelMapper {
    fn map_to_channels_and_access(
        &self,
        new_json: &str,
        _old_json: &str,
        _user_ctx: &Value,
    ) -> Result<MapperOutput, EvaluatorError> {
        let body: Body = serde_json::from_str(new_json)
            .map_err(|e| EvaluatorError::new(format!("unparseable document: {e}")))?;

        let names: Vec<String> = match body.get("channels") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        let channels = channel_set_from_array(&names, StarMode::Keep)
            .map_err(|e| EvaluatorError::new(e.to_string()))?;
        Ok(MapperOutput {
            channels,
            access: AccessMap::new(),
            rejection: None,
        })
    }
}

/// Builds the user context handed to mapping functions.
#[must_use]
pub fn make_user_ctx(name: Option<&str>, channels: &ChannelSet) -> Value {
    match name {
        Some(name) => json!({
            "name": name,
            "channels": channels.iter().collect::<Vec<_>>(),
        }),
        None => Value::Null,
    }
}

/// A mapper backed by a plain function; handy for configuring mapping
/// rules in process (tests, embedded deployments).
pub struct FnChannelMapper<F>(pub F);

impl<F> ChannelMapper for FnChannelMapper<F>
where
    F: Fn(&str, &str, &Value) -> Result<MapperOutput, EvaluatorError> + Send + Sync,
{
    fn map_to_channels_and_access(
        &self,
        new_json: &str,
        old_json: &str,
        user_ctx: &Value,
    ) -> Result<MapperOutput, EvaluatorError> {
        (self.0)(new_json, old_json, user_ctx)
    }
}

/// A validator backed by a plain function.
pub struct FnValidator<F>(pub F);

impl<F> Validator for FnValidator<F>
where
    F: Fn(&str, &str, &Value) -> Result<(u16, Option<String>), EvaluatorError> + Send + Sync,
{
    fn validate(
        &self,
        new_json: &str,
        old_json: &str,
        user_ctx: &Value,
    ) -> Result<(u16, Option<String>), EvaluatorError> {
        (self.0)(new_json, old_json, user_ctx)
    }
}

/// Convenience constructor for [`MapperOutput`] from channel names.
///
/// # Errors
///
/// Fails if any channel name is invalid.
pub fn mapper_output(channels: &[&str]) -> CoreResult<MapperOutput> {
    Ok(MapperOutput {
        channels: channel_set_from_array(channels, StarMode::Keep)?,
        access: AccessMap::new(),
        rejection: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mapper_reads_channels_property() {
        let mapper = DefaultChannelMapper::new();
        let out = mapper
            .map_to_channels_and_access(
                r#"{"channels": ["a", "b", 7, ""], "x": 1}"#,
                "",
                &Value::Null,
            )
            .unwrap();
        assert_eq!(out.channels.len(), 2);
        assert!(out.channels.contains("a"));
        assert!(out.channels.contains("b"));
        assert!(out.access.is_empty());
        assert!(out.rejection.is_none());
    }

    #[test]
    fn default_mapper_keeps_star() {
        let mapper = DefaultChannelMapper::new();
        let out = mapper
            .map_to_channels_and_access(r#"{"channels": ["*"]}"#, "", &Value::Null)
            .unwrap();
        assert!(out.channels.contains("*"));
    }

    #[test]
    fn default_mapper_no_channels_property() {
        let mapper = DefaultChannelMapper::new();
        let out = mapper
            .map_to_channels_and_access(r#"{"x": 1}"#, "", &Value::Null)
            .unwrap();
        assert!(out.channels.is_empty());
    }

    #[test]
    fn user_ctx_shape() {
        let channels: ChannelSet = ["a".to_string()].into();
        let ctx = make_user_ctx(Some("snej"), &channels);
        assert_eq!(ctx["name"], "snej");
        assert_eq!(ctx["channels"][0], "a");
        assert_eq!(make_user_ctx(None, &channels), Value::Null);
    }

    #[test]
    fn fn_mapper_delegates() {
        let mapper = FnChannelMapper(|new_json: &str, _old: &str, _ctx: &Value| {
            assert!(new_json.contains("x"));
            mapper_output(&["lobby"]).map_err(|e| EvaluatorError::new(e.to_string()))
        });
        let out = mapper
            .map_to_channels_and_access(r#"{"x":1}"#, "", &Value::Null)
            .unwrap();
        assert!(out.channels.contains("lobby"));
    }
}
