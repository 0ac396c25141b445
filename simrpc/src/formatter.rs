use crate::config::ConfigError;
use colored::*;
use simrpc_core::{
    client::{ClientError, InvokeResponse},
    descriptor::ResolveError,
    server::ServerError,
    tonic::Status,
};
use std::fmt::Display;

/// A wrapper struct for a formatted, colored string.
///
/// Implements `Display` so it can be printed directly.
pub struct FormattedString(pub String);

pub struct ServiceList(pub Vec<String>);

pub struct MethodList(pub String, pub Vec<String>);

pub struct GenericError<T: Display>(pub &'static str, pub T);

impl std::fmt::Display for FormattedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f)?;
        writeln!(f, "{}", self.0)?;
        Ok(())
    }
}

impl From<serde_json::Value> for FormattedString {
    fn from(value: serde_json::Value) -> Self {
        FormattedString(serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()))
    }
}

impl From<InvokeResponse> for FormattedString {
    fn from(response: InvokeResponse) -> Self {
        FormattedString::from(response.into_json())
    }
}

fn status(label: &str, method: &str, status: &Status) -> FormattedString {
    FormattedString(format!(
        "{} method={} code={:?} message={:?}",
        label.red().bold(),
        method,
        status.code(),
        status.message()
    ))
}

impl From<ClientError> for FormattedString {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Status { method, status: s } => status("gRPC Failed:", &method, &s),
            ClientError::Connect(err) => {
                FormattedString(format!("{}\n\n'{}'", "Connection Error:".red().bold(), err))
            }
            ClientError::Resolve(err) => FormattedString::from(err),
            ClientError::InvalidArgument { .. } => {
                FormattedString(format!("{}\n\n'{}'", "Invalid Request:".red().bold(), err))
            }
            err => FormattedString(format!("{}\n\n'{}'", "Call Failed:".red().bold(), err)),
        }
    }
}

impl From<ResolveError> for FormattedString {
    fn from(err: ResolveError) -> Self {
        let label = match err {
            ResolveError::PeerUnsupported(_) => "Server reflection unavailable (pass --proto):",
            ResolveError::Connection(_) => "Connection Error:",
            _ => "Schema Resolution Failed:",
        };
        FormattedString(format!("{}\n\n'{}'", label.red().bold(), err))
    }
}

impl From<ServerError> for FormattedString {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::Resolve(err) => FormattedString::from(err),
            err => FormattedString(format!("{}\n\n'{}'", "Server Error:".red().bold(), err)),
        }
    }
}

impl From<ConfigError> for FormattedString {
    fn from(err: ConfigError) -> Self {
        FormattedString(format!("{}\n\n'{}'", "Invalid Config:".red().bold(), err))
    }
}

impl<T: Display> From<GenericError<T>> for FormattedString {
    fn from(GenericError(msg, err): GenericError<T>) -> Self {
        FormattedString(format!("{}:\n\n'{}'", msg.red().bold(), err))
    }
}

impl From<ServiceList> for FormattedString {
    fn from(ServiceList(services): ServiceList) -> Self {
        if services.is_empty() {
            return FormattedString("No services found.".yellow().to_string());
        }

        let mut out = String::new();
        out.push_str("Available Services:\n");
        for svc in services {
            out.push_str(&format!("  - {}\n", svc.green()));
        }
        FormattedString(out.trim_end().to_string())
    }
}

impl From<MethodList> for FormattedString {
    fn from(MethodList(service, methods): MethodList) -> Self {
        if methods.is_empty() {
            return FormattedString(format!("{} {}", "No methods found in".yellow(), service));
        }

        let mut out = format!("{} {}:\n", "service".cyan(), service.green());
        for method in methods {
            out.push_str(&format!("  - {}\n", method.green()));
        }
        FormattedString(out.trim_end().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plain(format: impl FnOnce() -> FormattedString) -> String {
        colored::control::set_override(false);
        format().0
    }

    #[test]
    fn status_errors_show_code_and_message() {
        let out = plain(|| {
            FormattedString::from(ClientError::Status {
                method: "a.B.C".to_string(),
                status: Status::not_found("no such thing"),
            })
        });

        assert_eq!(
            out,
            "gRPC Failed: method=a.B.C code=NotFound message=\"no such thing\""
        );
    }

    #[test]
    fn stream_responses_print_as_a_json_array() {
        let out = plain(|| {
            InvokeResponse::Stream(vec![json!({ "n": 1 }), json!({ "n": 2 })]).into()
        });

        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed, json!([{ "n": 1 }, { "n": 2 }]));
    }

    #[test]
    fn empty_lists_say_so() {
        assert_eq!(plain(|| ServiceList(vec![]).into()), "No services found.");
        assert_eq!(
            plain(|| MethodList("a.B".to_string(), vec![]).into()),
            "No methods found in a.B"
        );
        assert_eq!(
            plain(|| ServiceList(vec!["a.B".to_string()]).into()),
            "Available Services:\n  - a.B"
        );
    }
}
