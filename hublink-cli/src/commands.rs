//! Command execution.

use crate::Commands;
use colored::Colorize;
use hublink_connection::HubClient;
use serde_json::Value;

/// Executes a command and returns the formatted output.
pub async fn execute(
    client: &HubClient,
    cmd: Commands,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Invoke { target, args } => {
            let arguments = parse_arguments(&args)?;
            let result = client.invoke(&target, arguments).await?;
            Ok(format_json(&result))
        }

        Commands::Stream { target, args } => {
            let arguments = parse_arguments(&args)?;
            let items = client.stream(&target, arguments).await?;
            if items.is_empty() {
                return Ok("Stream completed without items".yellow().to_string());
            }
            let lines: Vec<String> = items.iter().map(Value::to_string).collect();
            Ok(format!(
                "{}\n{} {} item(s)",
                lines.join("\n"),
                "Completed".green(),
                items.len()
            ))
        }

        Commands::Send { target, args } => {
            let arguments = parse_arguments(&args)?;
            client.send(&target, arguments).await?;
            Ok(format!("{} {}", "Sent".green(), target.cyan()))
        }

        Commands::Ping => {
            client.ping().await?;
            Ok("PING sent".green().to_string())
        }
    }
}

fn parse_arguments(args: &[String]) -> Result<Vec<Value>, Box<dyn std::error::Error>> {
    args.iter().map(|arg| parse_json_arg(arg)).collect()
}

/// Parses a JSON argument (either inline JSON or @file.json).
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_inline_arguments() {
        let args = vec!["1".to_string(), "\"two\"".to_string(), "[3]".to_string()];
        assert_eq!(
            parse_arguments(&args).unwrap(),
            vec![json!(1), json!("two"), json!([3])]
        );
    }

    #[test]
    fn test_parse_bare_word_fails() {
        assert!(parse_json_arg("hello").is_err());
    }

    #[test]
    fn test_parse_file_argument() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("arg.json");
        std::fs::write(&path, r#"{"a": 1}"#).unwrap();

        let value = parse_json_arg(&format!("@{}", path.display())).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn test_format_json() {
        assert_eq!(format_json(&json!(42)), "42");
        assert_eq!(format_json(&json!({"k": "v"})), "{\n  \"k\": \"v\"\n}");
    }
}
