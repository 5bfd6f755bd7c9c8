//! Response formatting for the client CLI

use colored::Colorize;
use lbfeedback_lib::ApiResponse;

/// Pretty-prints the agent's JSON response, its message and a terminal
/// success/failure line.
pub fn print_response(response: &ApiResponse) {
    let mut cleaned = response.clone();
    cleaned.request = None;
    cleaned.id = None;
    match serde_json::to_string_pretty(&cleaned) {
        Ok(json) => {
            println!("JSON response from the feedback agent:\n\n{json}\n");
        }
        Err(err) => print_error(&format!("failed to format response: {err}")),
    }
    if let Some(message) = &response.message {
        println!("{message}");
    }
    if let Some(output) = &response.output {
        println!("{output}");
    }
    if response.success {
        print_success("The operation was successful.");
    } else {
        print_error("The operation could not be completed.");
    }
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}
