use colored::Colorize;
use serde_json::Value;

pub fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(pretty) => println!("{pretty}"),
        Err(_) => println!("{value}"),
    }
}

/// Print a stored payload, pretty-printed when it is JSON.
pub fn print_payload(raw: &str) {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => print_json(&value),
        Err(_) => println!("{raw}"),
    }
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_miss(msg: &str) {
    println!("{} {}", "∅".yellow(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}
