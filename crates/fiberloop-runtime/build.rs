//! Build script for fiberloop-runtime
//!
//! Handles configuration merging:
//! 1. Start with library defaults
//! 2. If FL_CONFIG_RS env var is set, parse the user's config file
//! 3. Merge user values over defaults (user wins)
//! 4. Generate OUT_DIR/fl_merged_config.rs
//!
//! The user file only needs the values it wants to change.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

/// Configuration parameter definition
struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

/// All configuration parameters with their defaults
const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam {
        name: "NUM_WORKERS",
        rust_type: "usize",
        default_value: "4",
    },
    ConfigParam {
        name: "STACK_SIZE",
        rust_type: "usize",
        default_value: "128 * 1024",
    },
    ConfigParam {
        name: "GUARD_PAGES",
        rust_type: "bool",
        default_value: "true",
    },
    ConfigParam {
        name: "MAX_EVENTS",
        rust_type: "usize",
        default_value: "256",
    },
    ConfigParam {
        name: "MAX_WAIT_MS",
        rust_type: "u64",
        default_value: "5000",
    },
    ConfigParam {
        name: "CONNECT_TIMEOUT_MS",
        rust_type: "u64",
        default_value: "5000",
    },
    ConfigParam {
        name: "USE_CALLER",
        rust_type: "bool",
        default_value: "false",
    },
    ConfigParam {
        name: "STACK_POOL",
        rust_type: "usize",
        default_value: "64",
    },
];

fn main() {
    let Ok(out_dir) = env::var("OUT_DIR") else {
        println!("cargo:warning=OUT_DIR not set");
        return;
    };
    let dest_path = Path::new(&out_dir).join("fl_merged_config.rs");

    let mut config: HashMap<&str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    if let Ok(user_path) = env::var("FL_CONFIG_RS") {
        println!("cargo:rerun-if-changed={}", user_path);

        match fs::read_to_string(&user_path) {
            Ok(content) => {
                parse_and_merge(&content, &mut config);
                println!("cargo:warning=Using custom config: {}", user_path);
            }
            Err(e) => {
                println!("cargo:warning=Failed to read FL_CONFIG_RS ({}): {}", user_path, e);
            }
        }
    }

    println!("cargo:rerun-if-env-changed=FL_CONFIG_RS");

    let output = generate_config(&config);
    if let Err(e) = fs::write(&dest_path, output) {
        panic!("failed to write {}: {}", dest_path.display(), e);
    }
}

/// Parse the user's config file and merge values into `config`
fn parse_and_merge(content: &str, config: &mut HashMap<&str, String>) {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") || !line.starts_with("pub const ") {
            continue;
        }

        if let Some((name, value)) = parse_const_line(line) {
            match CONFIG_PARAMS.iter().find(|p| p.name == name) {
                Some(param) => {
                    config.insert(param.name, value);
                }
                None => println!("cargo:warning=Unknown config parameter: {}", name),
            }
        }
    }
}

/// `pub const NAME: TYPE = VALUE;` -> (NAME, VALUE)
fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?.trim();

    let colon_pos = rest.find(':')?;
    let name = rest[..colon_pos].trim().to_string();

    let eq_pos = rest.find('=')?;
    let semi_pos = rest.rfind(';').unwrap_or(rest.len());
    let value = rest[eq_pos + 1..semi_pos].trim().to_string();

    Some((name, value))
}

fn generate_config(config: &HashMap<&str, String>) -> String {
    let mut output = String::new();

    output.push_str("// Auto-generated by build.rs - do not edit\n");
    output.push_str("// Configuration merged from library defaults");
    if env::var("FL_CONFIG_RS").is_ok() {
        output.push_str(" and the user's FL_CONFIG_RS file");
    }
    output.push_str("\n\n");

    for param in CONFIG_PARAMS {
        let value = config.get(param.name).map_or(param.default_value, String::as_str);
        output.push_str(&format!(
            "pub const {}: {} = {};\n",
            param.name, param.rust_type, value
        ));
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_const_line() {
        let result = parse_const_line("pub const NUM_WORKERS: usize = 8;");
        assert_eq!(result, Some(("NUM_WORKERS".into(), "8".into())));

        let result = parse_const_line("pub const GUARD_PAGES: bool = false;");
        assert_eq!(result, Some(("GUARD_PAGES".into(), "false".into())));

        let result = parse_const_line("pub const STACK_SIZE: usize = 256 * 1024;");
        assert_eq!(result, Some(("STACK_SIZE".into(), "256 * 1024".into())));
    }

    #[test]
    fn test_parse_and_merge() {
        let mut config: HashMap<&str, String> = HashMap::new();
        config.insert("NUM_WORKERS", "4".into());
        config.insert("MAX_WAIT_MS", "5000".into());

        let user_config = r#"
            // Custom config
            pub const NUM_WORKERS: usize = 16;
            pub const MAX_WAIT_MS: u64 = 100;
            pub const NOT_A_KNOB: u64 = 1;
        "#;

        parse_and_merge(user_config, &mut config);

        assert_eq!(config.get("NUM_WORKERS"), Some(&"16".to_string()));
        assert_eq!(config.get("MAX_WAIT_MS"), Some(&"100".to_string()));
        assert_eq!(config.get("NOT_A_KNOB"), None);
    }
}
