use serde_json::json;

use crate::job::error::ReportError;

pub fn ok(result: serde_json::Value) -> serde_json::Value {
    json!({
        "ok": true,
        "result": result
    })
}

pub fn err(code: &str, message: impl Into<String>) -> serde_json::Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message.into(),
        },
    })
}

impl ReportError {
    pub fn response(&self) -> serde_json::Value {
        err(self.code(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_carries_code() {
        let v = ReportError::validation("missing requesterId").response();
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "validation_failed");
        assert_eq!(v["error"]["message"], "missing requesterId");
        assert_eq!(ok(json!({"n": 1}))["result"]["n"], 1);
    }
}
