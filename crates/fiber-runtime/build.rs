//! Build script for fiber-runtime
//!
//! Merges the runtime defaults below with an optional user file named by
//! `FIBER_CONFIG_RS` (lines of `pub const NAME: TYPE = VALUE;`, user wins)
//! and writes `OUT_DIR/fiber_merged_config.rs`. Only the values to change
//! need to appear in the user file.

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
        name: "CONCURRENCY",
        rust_type: "usize",
        default_value: "4",
    },
    ConfigParam {
        name: "MIN_CONCURRENCY",
        rust_type: "usize",
        default_value: "0", // 0 = start every worker eagerly
    },
    ConfigParam {
        name: "STACK_SIZE_SMALL",
        rust_type: "usize",
        default_value: "32 * 1024",
    },
    ConfigParam {
        name: "STACK_SIZE_NORMAL",
        rust_type: "usize",
        default_value: "1024 * 1024",
    },
    ConfigParam {
        name: "STACK_SIZE_LARGE",
        rust_type: "usize",
        default_value: "8 * 1024 * 1024",
    },
    ConfigParam {
        name: "STACK_SIZE_PTHREAD",
        rust_type: "usize",
        default_value: "8 * 1024 * 1024",
    },
    ConfigParam {
        name: "GUARD_PAGE_SIZE",
        rust_type: "usize",
        default_value: "4096",
    },
    ConfigParam {
        name: "TC_STACK_SMALL",
        rust_type: "usize",
        default_value: "32",
    },
    ConfigParam {
        name: "TC_STACK_NORMAL",
        rust_type: "usize",
        default_value: "8",
    },
    ConfigParam {
        name: "TC_STACK_LARGE",
        rust_type: "usize",
        default_value: "2",
    },
    ConfigParam {
        name: "TC_STACK_PTHREAD",
        rust_type: "usize",
        default_value: "1",
    },
    ConfigParam {
        name: "RUNQUEUE_CAPACITY",
        rust_type: "usize",
        default_value: "4096",
    },
    ConfigParam {
        name: "YIELD_BEFORE_IDLE",
        rust_type: "u32",
        default_value: "0",
    },
    ConfigParam {
        name: "NTAGS",
        rust_type: "usize",
        default_value: "1",
    },
    ConfigParam {
        name: "GROUP_DELETE_DELAY_MS",
        rust_type: "u64",
        default_value: "1000",
    },
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest_path = Path::new(&out_dir).join("fiber_merged_config.rs");

    let mut config: HashMap<&'static str, String> = CONFIG_PARAMS
        .iter()
        .map(|p| (p.name, p.default_value.to_string()))
        .collect();

    println!("cargo:rerun-if-env-changed=FIBER_CONFIG_RS");
    let user_path = env::var("FIBER_CONFIG_RS").ok();
    if let Some(path) = &user_path {
        println!("cargo:rerun-if-changed={}", path);
        match fs::read_to_string(path) {
            Ok(content) => {
                for name in parse_and_merge(&content, &mut config) {
                    println!("cargo:warning=Unknown config parameter in {}: {}", path, name);
                }
            }
            Err(e) => println!("cargo:warning=Cannot read FIBER_CONFIG_RS ({}): {}", path, e),
        }
    }

    let output = generate_config(&config, user_path.as_deref());
    fs::write(&dest_path, output).expect("Failed to write merged config");
}

/// Merge every `pub const NAME: TYPE = VALUE;` line of `content` over the
/// defaults. Returns the names that are not known parameters.
fn parse_and_merge(content: &str, config: &mut HashMap<&'static str, String>) -> Vec<String> {
    let mut unknown = Vec::new();
    let lines = content
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("pub const "));

    for (name, value) in lines.filter_map(parse_const_line) {
        match CONFIG_PARAMS.iter().find(|p| p.name == name) {
            Some(param) => {
                config.insert(param.name, value);
            }
            None => unknown.push(name),
        }
    }
    unknown
}

/// Split `pub const NAME: TYPE = VALUE;` into (NAME, VALUE)
fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?;
    let (name, rest) = rest.split_once(':')?;
    let (_ty, value) = rest.split_once('=')?;
    let value = value.trim().trim_end_matches(';').trim();
    Some((name.trim().to_string(), value.to_string()))
}

fn generate_config(config: &HashMap<&'static str, String>, user_path: Option<&str>) -> String {
    let mut output = String::from("// Generated by build.rs, do not edit\n");
    if let Some(path) = user_path {
        output.push_str(&format!("// Overrides from {}\n", path));
    }
    output.push('\n');

    for param in CONFIG_PARAMS {
        let value = config
            .get(param.name)
            .map(String::as_str)
            .unwrap_or(param.default_value);
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
        let result = parse_const_line("pub const CONCURRENCY: usize = 8;");
        assert_eq!(result, Some(("CONCURRENCY".into(), "8".into())));

        let result = parse_const_line("pub const YIELD_BEFORE_IDLE: u32 = 3 ;");
        assert_eq!(result, Some(("YIELD_BEFORE_IDLE".into(), "3".into())));

        let result = parse_const_line("pub const STACK_SIZE_LARGE: usize = 16 * 1024 * 1024;");
        assert_eq!(
            result,
            Some(("STACK_SIZE_LARGE".into(), "16 * 1024 * 1024".into()))
        );
    }

    #[test]
    fn test_parse_and_merge() {
        let mut config: HashMap<&'static str, String> = HashMap::new();
        config.insert("CONCURRENCY", "4".into());
        config.insert("NTAGS", "1".into());

        let user_config = r#"
            // Two tags of eight workers
            pub const CONCURRENCY: usize = 16;
            pub const NTAGS: usize = 2;
            pub const NOT_A_PARAM: usize = 1;
        "#;

        let unknown = parse_and_merge(user_config, &mut config);
        assert_eq!(unknown, vec!["NOT_A_PARAM".to_string()]);

        assert_eq!(config.get("CONCURRENCY"), Some(&"16".to_string()));
        assert_eq!(config.get("NTAGS"), Some(&"2".to_string()));
        assert!(config.get("NOT_A_PARAM").is_none());
    }
}