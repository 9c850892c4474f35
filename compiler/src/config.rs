//! Compile options and device capability descriptors.
//!
//! Both are plain serde structs so the embedding runtime can load them from
//! TOML next to its device configuration.

use crate::error::{CompileError, CompileResult};
use crate::ir::Kind;
use serde::{Deserialize, Serialize};

/// Per-compile switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompileOptions {
    /// Map parallel loops onto device threads where the device allows it.
    pub parallelize: bool,
    pub inline: bool,
    /// Largest callee body, in nodes, considered for inlining.
    pub max_inline_nodes: usize,
    pub full_unroll_max_trip: u64,
    /// Largest unrolled body, in nodes, across all iterations.
    pub full_unroll_max_nodes: usize,
    pub escape_analysis: bool,
    pub float_reads: bool,
    /// Bytes between an array reference and its first element.
    pub array_header_bytes: u32,
    /// Global addresses are offsets from the heap base rather than absolute.
    pub relative_addresses: bool,
    /// Interleave node descriptions as comments in text payloads.
    pub emit_comments: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            parallelize: true,
            inline: true,
            max_inline_nodes: 64,
            full_unroll_max_trip: 16,
            full_unroll_max_nodes: 256,
            escape_analysis: true,
            float_reads: true,
            array_header_bytes: 24,
            relative_addresses: false,
            emit_comments: false,
        }
    }
}

impl CompileOptions {
    pub fn from_toml_str(source: &str) -> CompileResult<Self> {
        let options: CompileOptions = toml::from_str(source)
            .map_err(|e| CompileError::Config(format!("compile options: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> CompileResult<()> {
        if self.array_header_bytes % 8 != 0 {
            return Err(CompileError::Config(format!(
                "array_header_bytes must be a multiple of 8, got {}",
                self.array_header_bytes
            )));
        }
        Ok(())
    }

    /// Options with every optional transformation switched off.
    pub fn minimal() -> Self {
        Self {
            parallelize: false,
            inline: false,
            escape_analysis: false,
            float_reads: false,
            full_unroll_max_trip: 0,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ByteOrder {
    Little,
    Big,
}

/// How a parallel loop is split across device threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulingStrategy {
    /// Grid-stride: thread t runs iterations t, t + n, t + 2n, ...
    PerIteration,
    /// Each thread runs one contiguous block of iterations.
    PerBlock,
}

/// What the front end knows about the device a kernel is compiled for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Maximum work items per dimension; its length is the device dimensionality.
    pub max_work_items: Vec<u64>,
    #[serde(default = "default_true")]
    pub supports_fp64: bool,
    #[serde(default)]
    pub supports_fp16: bool,
    #[serde(default = "default_address_bits")]
    pub address_bits: u32,
    #[serde(default = "default_byte_order")]
    pub byte_order: ByteOrder,
    #[serde(default = "default_scheduling")]
    pub scheduling: SchedulingStrategy,
}

fn default_true() -> bool {
    true
}

fn default_address_bits() -> u32 {
    64
}

fn default_byte_order() -> ByteOrder {
    ByteOrder::Little
}

fn default_scheduling() -> SchedulingStrategy {
    SchedulingStrategy::PerIteration
}

impl DeviceDescriptor {
    /// A three-dimensional GPU with the given per-dimension limit.
    pub fn gpu(id: impl Into<String>, max_work_items: u64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            max_work_items: vec![max_work_items; 3],
            supports_fp64: true,
            supports_fp16: false,
            address_bits: 64,
            byte_order: ByteOrder::Little,
            scheduling: SchedulingStrategy::PerIteration,
        }
    }

    pub fn from_toml_str(source: &str) -> CompileResult<Self> {
        let device: DeviceDescriptor = toml::from_str(source)
            .map_err(|e| CompileError::Config(format!("device descriptor: {}", e)))?;
        device.validate()?;
        Ok(device)
    }

    pub fn validate(&self) -> CompileResult<()> {
        if self.max_work_items.is_empty() || self.max_work_items.len() > 3 {
            return Err(CompileError::Config(format!(
                "device {} reports {} dimensions, expected 1 to 3",
                self.id,
                self.max_work_items.len()
            )));
        }
        if self.address_bits != 32 && self.address_bits != 64 {
            return Err(CompileError::Config(format!(
                "address_bits must be 32 or 64, got {}",
                self.address_bits
            )));
        }
        Ok(())
    }

    pub fn dimensions(&self) -> usize {
        self.max_work_items.len()
    }

    /// Maximum work items on `dim`, `None` past the device dimensionality.
    pub fn max_work_items(&self, dim: u8) -> Option<u64> {
        self.max_work_items.get(dim as usize).copied()
    }

    /// Unsigned kind wide enough to hold a device address.
    pub fn word_kind(&self) -> Kind {
        if self.address_bits == 32 {
            Kind::U32
        } else {
            Kind::U64
        }
    }

    /// Signed kind used for address offsets.
    pub fn offset_kind(&self) -> Kind {
        if self.address_bits == 32 {
            Kind::S32
        } else {
            Kind::S64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_round_trip_through_toml() {
        let options = CompileOptions::from_toml_str("inline = false\nfull_unroll_max_trip = 4\n")
            .unwrap();
        assert!(!options.inline);
        assert_eq!(options.full_unroll_max_trip, 4);
        assert!(options.parallelize);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = CompileOptions::from_toml_str("vectorise = true").unwrap_err();
        assert!(matches!(err, CompileError::Config(_)));
    }

    #[test]
    fn test_header_alignment_validated() {
        let err = CompileOptions::from_toml_str("array_header_bytes = 12").unwrap_err();
        assert!(err.to_string().contains("multiple of 8"));
    }

    #[test]
    fn test_device_from_toml() {
        let device = DeviceDescriptor::from_toml_str(
            r#"
            id = "cpu0"
            max_work_items = [8]
            supports_fp64 = false
            scheduling = "per-block"
            "#,
        )
        .unwrap();
        assert_eq!(device.dimensions(), 1);
        assert_eq!(device.max_work_items(0), Some(8));
        assert_eq!(device.max_work_items(1), None);
        assert_eq!(device.scheduling, SchedulingStrategy::PerBlock);
        assert_eq!(device.word_kind(), Kind::U64);
    }

    #[test]
    fn test_device_dimensionality_validated() {
        let err = DeviceDescriptor::from_toml_str("id = \"x\"\nmax_work_items = []").unwrap_err();
        assert!(err.to_string().contains("dimensions"));
    }
}
