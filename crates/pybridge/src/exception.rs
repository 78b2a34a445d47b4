use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// An exception raised inside the guest interpreter, reported over the
/// status pipe as JSON. Chained exceptions arrive as a recursive `cause`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestException {
    /// Exception class name, e.g. `ValueError`.
    #[serde(rename = "exception")]
    pub kind: String,

    pub message: String,

    /// Full interpreter traceback.
    #[serde(default)]
    pub traceback: String,

    /// The exception this one was raised from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<GuestException>>,

    /// Constructor arguments of the exception object, when the guest
    /// reports them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<serde_json::Value>>,
}

impl GuestException {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|err| BridgeError::Framing(format!("malformed exception record: {err}")))
    }

    /// Iterates this exception and its causes, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &GuestException> {
        std::iter::successors(Some(self), |ex| ex.cause.as_deref())
    }
}

impl fmt::Display for GuestException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}\n{}", self.kind, self.message, self.traceback)?;
        let mut cause = self.cause.as_deref();
        while let Some(ex) = cause {
            write!(f, "\nCaused by: {}: {}\n{}", ex.kind, ex.message, ex.traceback)?;
            cause = ex.cause.as_deref();
        }
        Ok(())
    }
}

impl std::error::Error for GuestException {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|ex| ex as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_flat_exception() {
        let raw = br#"{"type":"exception","exception":"ValueError","message":"bad input","traceback":"Traceback (most recent call last):\n  ..."}"#;
        let ex = GuestException::from_json(raw).unwrap();
        assert_eq!(ex.kind, "ValueError");
        assert_eq!(ex.message, "bad input");
        assert!(ex.cause.is_none());
    }

    #[test]
    fn parses_a_chained_exception() {
        let raw = br#"{
            "exception": "DatabaseError",
            "message": "query failed",
            "traceback": "tb-outer",
            "cause": {
                "exception": "ConnectionError",
                "message": "connection refused",
                "traceback": "tb-inner"
            }
        }"#;
        let ex = GuestException::from_json(raw).unwrap();
        assert_eq!(ex.kind, "DatabaseError");
        let cause = ex.cause.as_deref().unwrap();
        assert_eq!(cause.kind, "ConnectionError");
        assert_eq!(ex.chain().count(), 2);
    }

    #[test]
    fn display_names_every_link_of_the_chain() {
        let ex = GuestException {
            kind: "DatabaseError".into(),
            message: "query failed".into(),
            traceback: String::new(),
            cause: Some(Box::new(GuestException {
                kind: "ConnectionError".into(),
                message: "connection refused".into(),
                traceback: String::new(),
                cause: None,
                args: None,
            })),
            args: None,
        };
        let text = ex.to_string();
        assert!(text.contains("DatabaseError"));
        assert!(text.contains("ConnectionError"));
    }

    #[test]
    fn args_round_trip() {
        let raw = br#"{"exception":"KeyError","message":"'k'","traceback":"","args":["k",2]}"#;
        let ex = GuestException::from_json(raw).unwrap();
        let args = ex.args.unwrap();
        assert_eq!(args, vec![serde_json::json!("k"), serde_json::json!(2)]);
    }

    #[test]
    fn malformed_record_is_a_framing_error() {
        let err = GuestException::from_json(b"{not json").unwrap_err();
        assert!(matches!(err, BridgeError::Framing(_)));
    }
}
