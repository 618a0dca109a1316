//! Maps the 0-7 verbosity scale onto tracing level filters.

use tracing_subscriber::EnvFilter;

/// Module targets addressed by successive `section_verbosity` digits.
/// A digit of 0 defers to the global verbosity.
const SECTION_TARGETS: [&str; 4] = [
    "davmount_core::fs",
    "davmount_core::store",
    "davmount_core::webdav",
    "davmount_core::worker",
];

pub fn init(verbosity: u8, section_verbosity: Option<&str>) {
    let directives = build_directives(verbosity, section_verbosity);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .with_target(true)
        .init();
}

fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0..=2 => "error",
        3 | 4 => "warn",
        5 => "info",
        6 => "debug",
        _ => "trace",
    }
}

fn build_directives(verbosity: u8, section_verbosity: Option<&str>) -> String {
    let mut directives = level_for(verbosity).to_string();
    if let Some(sections) = section_verbosity {
        for (target, digit) in SECTION_TARGETS.iter().zip(sections.chars()) {
            match digit.to_digit(10) {
                Some(0) | None => {}
                Some(level) => {
                    directives.push_str(&format!(",{target}={}", level_for(level as u8)));
                }
            }
        }
    }
    directives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(level_for(0), "error");
        assert_eq!(level_for(4), "warn");
        assert_eq!(level_for(5), "info");
        assert_eq!(level_for(6), "debug");
        assert_eq!(level_for(7), "trace");
    }

    #[test]
    fn section_digits_override_per_module() {
        assert_eq!(build_directives(5, None), "info");
        assert_eq!(
            build_directives(5, Some("0700")),
            "info,davmount_core::store=trace"
        );
        assert_eq!(
            build_directives(3, Some("66")),
            "warn,davmount_core::fs=debug,davmount_core::store=debug"
        );
    }
}
