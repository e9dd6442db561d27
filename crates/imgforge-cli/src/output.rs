use serde::Serialize;

use imgforge_domain::ErrorBody;

/// Envelope every command result is rendered through in JSON mode.
#[derive(Serialize)]
struct JsonEnvelope<T: Serialize> {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

pub fn emit_success<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) {
    if json {
        let envelope = JsonEnvelope {
            status: "ok",
            result: Some(value),
            error: None,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&envelope).expect("result serializes")
        );
    } else {
        human(value);
    }
}

pub fn emit_error(json: bool, err: &anyhow::Error) -> i32 {
    let body = ErrorBody::from_anyhow(err);
    if json {
        let envelope: JsonEnvelope<()> = JsonEnvelope {
            status: "error",
            result: None,
            error: Some(body),
        };
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&envelope).expect("error serializes")
        );
    } else {
        eprintln!("error[{}]: {}", body.code.as_str(), body.message);
        if let Some(log_path) = &body.log_path {
            eprintln!("  log: {log_path}");
        }
        if let Some(details) = &body.details {
            eprintln!("  details: {details}");
        }
    }
    1
}
