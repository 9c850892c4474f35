//! Diagnostic codes for compile failures
//!
//! Every failure a compile unit can raise carries a stable numeric code so the
//! device runtime can decide how to fall back without matching on message text.
//!
//! # Ranges
//!
//! - E5000-E5999: code generation (hundreds digit: 0 general, 1 memory
//!   regions, 2 graph structure, 3 configuration)
//! - E8000-E8999: target selection
//! - E9000-E9999: internal invariants

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode {
    pub code: u16,
    pub category: &'static str,
    pub description: &'static str,
    /// What the caller can change to avoid the failure
    pub help: Option<&'static str>,
}

impl ErrorCode {
    /// "E5001" style spelling.
    pub fn format_code(&self) -> String {
        format_error_code(self.code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.format_code(), self.category, self.description)
    }
}

pub const UNSUPPORTED_CONSTRUCT: u16 = 5001;
pub const UNSUPPORTED_KIND: u16 = 5002;
pub const INVALID_REGION: u16 = 5101;
pub const WRITE_TO_CONSTANT_REGION: u16 = 5102;
pub const MALFORMED_GRAPH: u16 = 5201;
pub const INVALID_OPTIONS: u16 = 5301;
pub const UNKNOWN_TARGET: u16 = 8001;
pub const INTERNAL_ERROR: u16 = 9001;

/// Sorted by code.
static CODES: &[ErrorCode] = &[
    ErrorCode {
        code: UNSUPPORTED_CONSTRUCT,
        category: "Codegen",
        description: "Operation not supported on this target",
        help: Some("Run the method on the host or pick a target with the required capability"),
    },
    ErrorCode {
        code: UNSUPPORTED_KIND,
        category: "Codegen",
        description: "Value kind not supported by target or device",
        help: Some("Check 64-bit float, half and vector lane support of the device"),
    },
    ErrorCode {
        code: INVALID_REGION,
        category: "Memory",
        description: "Memory access cannot be attributed to exactly one region",
        help: Some("Avoid merging arrays from different address spaces in one access"),
    },
    ErrorCode {
        code: WRITE_TO_CONSTANT_REGION,
        category: "Memory",
        description: "Write to a constant-region array",
        help: Some("Constant parameters are read-only on the device"),
    },
    ErrorCode {
        code: MALFORMED_GRAPH,
        category: "Graph",
        description: "Malformed kernel graph",
        help: Some("The front end produced a graph that violates a structural invariant"),
    },
    ErrorCode {
        code: INVALID_OPTIONS,
        category: "Config",
        description: "Invalid compile options or device descriptor",
        help: None,
    },
    ErrorCode {
        code: UNKNOWN_TARGET,
        category: "Target",
        description: "Unknown code generation target",
        help: Some("Known targets: ptx, opencl, spirv, metal"),
    },
    ErrorCode {
        code: INTERNAL_ERROR,
        category: "Internal",
        description: "Internal compiler error",
        help: Some("An invariant of the compiler itself was violated; please report it"),
    },
];

pub fn all_codes() -> &'static [ErrorCode] {
    CODES
}

pub fn get_error_code(code: u16) -> Option<&'static ErrorCode> {
    CODES
        .binary_search_by_key(&code, |entry| entry.code)
        .ok()
        .map(|index| &CODES[index])
}

/// Codes in `start..=end`.
pub fn codes_in_range(start: u16, end: u16) -> impl Iterator<Item = &'static ErrorCode> {
    CODES
        .iter()
        .filter(move |entry| (start..=end).contains(&entry.code))
}

pub fn format_error_code(code: u16) -> String {
    format!("E{:04}", code)
}

/// "E5101" -> 5101
pub fn parse_error_code(code_str: &str) -> Option<u16> {
    code_str.strip_prefix('E')?.parse::<u16>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_sorted_and_unique() {
        assert!(all_codes().windows(2).all(|w| w[0].code < w[1].code));
    }

    #[test]
    fn test_lookup() {
        let region = get_error_code(INVALID_REGION).unwrap();
        assert_eq!(region.category, "Memory");
        assert_eq!(region.to_string(), "E5101 [Memory]: Memory access cannot be attributed to exactly one region");
        assert!(get_error_code(1001).is_none());

        let parsed = parse_error_code("E5201").and_then(get_error_code).unwrap();
        assert_eq!(parsed.code, MALFORMED_GRAPH);
        assert_eq!(parse_error_code("5101"), None);
    }

    #[test]
    fn test_ranges() {
        assert_eq!(codes_in_range(5000, 5999).count(), 6);
        assert_eq!(codes_in_range(8000, 8999).count(), 1);
        assert_eq!(format_error_code(42), "E0042");
    }
}
