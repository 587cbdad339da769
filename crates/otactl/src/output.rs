//! Output formatting for CLI responses

use anyhow::Error;
use colored::*;
use dualboot_ota::{OtaError, StatusReport, WriteReport};
use serde_json::json;

use crate::error::CliError;

/// Print error in JSON format
pub fn print_error_json(error: &Error) {
    let error_json = json!({
        "success": false,
        "error": {
            "message": error.to_string(),
            "type": error_type_name(error)
        }
    });
    match serde_json::to_string_pretty(&error_json) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("Failed to format error as JSON: {}", e),
    }
}

/// Print error in human-readable format
pub fn print_error_human(error: &Error) {
    eprintln!("{} {}", "Error:".red().bold(), error);

    let mut source = error.source();
    while let Some(err) = source {
        eprintln!("  {} {}", "Caused by:".yellow(), err);
        source = err.source();
    }
}

/// Print the device status report
pub fn print_status(report: &StatusReport, json: bool) {
    if json {
        let output = json!({
            "success": true,
            "status": report
        });
        match serde_json::to_string_pretty(&output) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Failed to format status as JSON: {}", e),
        }
        return;
    }

    println!("{}", "Device Status:".bold());
    println!("{}", "═".repeat(60));
    for line in report.render() {
        if line.starts_with("Partition table:") {
            println!();
            println!("{}", line.bold());
        } else if line.starts_with("The new image is pending") {
            println!("{} {}", "⚠".yellow(), line.yellow());
        } else if line == "The bootloader does not support OTA." {
            println!("{} {}", "✗".red(), line.red());
        } else {
            println!("{}", line);
        }
    }
}

/// Print the outcome of a completed write session
pub fn print_write_report(report: &WriteReport, json: bool) {
    if json {
        let output = json!({
            "success": true,
            "update": report
        });
        match serde_json::to_string_pretty(&output) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Failed to format update report as JSON: {}", e),
        }
    } else {
        println!();
        println!("{}", "═".repeat(60));
        print_success(
            &format!(
                "Wrote {} bytes to partition '{}'",
                report.bytes_written, report.partition.label
            ),
            false,
        );
        println!("  {}: {}", "SHA-256".dimmed(), report.digest);
        println!(
            "  {}",
            "The new image boots on the next restart and must be confirmed.".dimmed()
        );
    }
}

/// Print success message
pub fn print_success(message: &str, json: bool) {
    if json {
        let output = json!({
            "success": true,
            "message": message
        });
        match serde_json::to_string_pretty(&output) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Failed to format success message as JSON: {}", e),
        }
    } else {
        println!("{} {}", "✓".green(), message);
    }
}

/// Print warning message
pub fn print_warning(message: &str, json: bool) {
    if json {
        let output = json!({
            "success": true,
            "warning": message
        });
        match serde_json::to_string_pretty(&output) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Failed to format warning message as JSON: {}", e),
        }
    } else {
        println!("{} {}", "⚠".yellow(), message);
    }
}

/// Variant name of the underlying error for JSON output
fn error_type_name(error: &Error) -> String {
    let debug = match (error.downcast_ref::<CliError>(), error.downcast_ref::<OtaError>()) {
        (Some(CliError::Ota(e)), _) | (None, Some(e)) => format!("{:?}", e),
        (Some(e), _) => format!("{:?}", e),
        (None, None) => return "Unknown".to_string(),
    };
    debug
        .split(['(', ' ', '{'])
        .next()
        .unwrap_or("Unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_name_of_library_error() {
        let err = Error::new(OtaError::Busy("ota_1".to_string()));
        assert_eq!(error_type_name(&err), "Busy");

        let err = Error::new(CliError::Ota(OtaError::LengthMismatch {
            expected: 2,
            actual: 1,
        }));
        assert_eq!(error_type_name(&err), "LengthMismatch");
    }

    #[test]
    fn test_error_type_name_of_cli_error() {
        let err = Error::new(CliError::ValidationError("bad".to_string()));
        assert_eq!(error_type_name(&err), "ValidationError");
        assert_eq!(error_type_name(&anyhow::anyhow!("plain")), "Unknown");
    }
}
