//! Wire format of the remote command server.
//!
//! Requests are JSON objects tagged by `cmd`:
//!
//! ```text
//! {"cmd":"Get","widget_nickname":"TC","field_name":"Temperature","printout":true}
//! {"cmd":"Set","widget_nickname":"MFC A","field_name":"Setpoint Entry","new_value":"20","printout":true}
//! {"cmd":"Confirm","widget_nickname":"MFC A","printout":true}
//! {"cmd":"Eval","code":"get_field(dashboard, \"TC\", \"Temperature\")","printout":false}
//! {"cmd":"Exec","code":"confirm(dashboard, \"Pump\")","printout":false}
//! {"cmd":"Close"}
//! ```
//!
//! Every request but `Close` gets exactly one response line: the result text, `Success`, or
//! `Error: <message>`.

use crate::error::{AppResult, PanelError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Response to requests that return no value.
pub const SUCCESS: &str = "Success";

/// Prefix of every error response.
pub const ERROR_PREFIX: &str = "Error: ";

fn default_printout() -> bool {
    true
}

/// One request line. The `cmd` key selects the variant; `printout` defaults to true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum RpcRequest {
    /// Read a field.
    Get {
        /// Widget nickname
        widget_nickname: String,
        /// Field name
        field_name: String,
        /// Log the request on the server
        #[serde(default = "default_printout")]
        printout: bool,
    },
    /// Write a field without confirming it.
    Set {
        /// Widget nickname
        widget_nickname: String,
        /// Field name
        field_name: String,
        /// New value
        new_value: String,
        /// Log the request on the server
        #[serde(default = "default_printout")]
        printout: bool,
    },
    /// Push a widget's inputs to its device.
    Confirm {
        /// Widget nickname
        widget_nickname: String,
        /// Log the request on the server
        #[serde(default = "default_printout")]
        printout: bool,
    },
    /// Evaluate a Rhai expression; the reply is its value.
    Eval {
        /// Rhai source
        code: String,
        /// Log the request on the server
        #[serde(default = "default_printout")]
        printout: bool,
    },
    /// Run Rhai statements; the reply is `Success`.
    Exec {
        /// Rhai source
        code: String,
        /// Log the request on the server
        #[serde(default = "default_printout")]
        printout: bool,
    },
    /// End the session. Not answered.
    Close,
}

impl RpcRequest {
    /// Encode as one line, newline included.
    pub fn encode(&self) -> AppResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one request line. Surrounding whitespace is ignored.
    pub fn decode(line: &str) -> AppResult<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| PanelError::Rpc(format!("malformed request: {}", e)))
    }

    /// Whether the server should log the request.
    pub fn printout(&self) -> bool {
        match self {
            RpcRequest::Get { printout, .. }
            | RpcRequest::Set { printout, .. }
            | RpcRequest::Confirm { printout, .. }
            | RpcRequest::Eval { printout, .. }
            | RpcRequest::Exec { printout, .. } => *printout,
            RpcRequest::Close => false,
        }
    }

    /// Command name, as in the `cmd` key.
    pub fn command(&self) -> &'static str {
        match self {
            RpcRequest::Get { .. } => "Get",
            RpcRequest::Set { .. } => "Set",
            RpcRequest::Confirm { .. } => "Confirm",
            RpcRequest::Eval { .. } => "Eval",
            RpcRequest::Exec { .. } => "Exec",
            RpcRequest::Close => "Close",
        }
    }
}

impl fmt::Display for RpcRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcRequest::Get {
                widget_nickname,
                field_name,
                ..
            } => write!(f, "Get {} in {}", field_name, widget_nickname),
            RpcRequest::Set {
                widget_nickname,
                field_name,
                new_value,
                ..
            } => write!(
                f,
                "Set {} in {} to {}",
                field_name, widget_nickname, new_value
            ),
            RpcRequest::Confirm {
                widget_nickname, ..
            } => write!(f, "Confirm in {}", widget_nickname),
            RpcRequest::Eval { .. } => f.write_str("eval"),
            RpcRequest::Exec { .. } => f.write_str("exec"),
            RpcRequest::Close => f.write_str("close"),
        }
    }
}

/// Make a response fit on one line.
pub fn response_line(text: &str) -> String {
    let mut line: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    line.push('\n');
    line
}

/// Response line for a failure.
pub fn error_response(err: &impl fmt::Display) -> String {
    format!("{}{}", ERROR_PREFIX, err)
}

/// Whether a response reports a failure.
pub fn is_error(response: &str) -> bool {
    response.starts_with(ERROR_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_requests_from_other_clients() {
        let request = RpcRequest::decode(
            r#"{"cmd":"Set","widget_nickname":"TC","field_name":"Setpoint","new_value":"3","printout":false}"#,
        )
        .unwrap();
        assert_eq!(
            request,
            RpcRequest::Set {
                widget_nickname: "TC".into(),
                field_name: "Setpoint".into(),
                new_value: "3".into(),
                printout: false,
            }
        );
        assert_eq!(request.to_string(), "Set Setpoint in TC to 3");

        let get = RpcRequest::decode(r#"{"cmd":"Get","widget_nickname":"TC","field_name":"T"}"#)
            .unwrap();
        assert!(get.printout());
        assert_eq!(RpcRequest::decode(r#"{"cmd":"Close"}"#).unwrap(), RpcRequest::Close);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(RpcRequest::decode("not json").is_err());
        assert!(RpcRequest::decode(r#"{"cmd":"Launch"}"#).is_err());
        assert!(RpcRequest::decode(r#"{"cmd":"Eval"}"#).is_err());
    }

    #[test]
    fn encoded_request_is_one_line() {
        let line = RpcRequest::Eval {
            code: "let x = 1;\nx + 1".into(),
            printout: true,
        }
        .encode()
        .unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.starts_with(r#"{"cmd":"Eval""#));
    }

    #[test]
    fn responses() {
        assert_eq!(response_line("a\nb"), "a b\n");
        let err = error_response(&"boom");
        assert_eq!(err, "Error: boom");
        assert!(is_error(&err));
        assert!(!is_error(SUCCESS));
    }
}
