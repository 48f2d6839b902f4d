//! Register Map
//!
//! A device model is a static table of attributes, each bound to one register
//! address and an optional read and write capability. Tables are declared in
//! YAML model files and loaded once at startup; a model that fails validation
//! keeps the agent from starting.

use crate::derived::{DerivedEntry, DerivedTable};
use crate::error::{FieldgateError, Result};
use crate::logging::get_logger;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Function code family used to read an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "CapabilityRepr")]
pub enum ReadCapability {
    /// 0x01
    Coils,
    /// 0x02
    DiscreteInputs,
    /// 0x03
    HoldingRegisters,
    /// 0x04
    InputRegisters,
}

/// Function code family used to write an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "CapabilityRepr")]
pub enum WriteCapability {
    /// 0x06
    SingleRegister,
    /// 0x10
    MultipleRegisters,
}

/// Capabilities may be written by name or by raw function code
#[derive(Deserialize)]
#[serde(untagged)]
enum CapabilityRepr {
    Code(u8),
    Name(String),
}

impl ReadCapability {
    pub fn function_code(self) -> u8 {
        match self {
            ReadCapability::Coils => 0x01,
            ReadCapability::DiscreteInputs => 0x02,
            ReadCapability::HoldingRegisters => 0x03,
            ReadCapability::InputRegisters => 0x04,
        }
    }

    pub fn from_function_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(ReadCapability::Coils),
            0x02 => Some(ReadCapability::DiscreteInputs),
            0x03 => Some(ReadCapability::HoldingRegisters),
            0x04 => Some(ReadCapability::InputRegisters),
            _ => None,
        }
    }

    /// Coils and discrete inputs carry one bit per address
    pub fn is_bit_access(self) -> bool {
        matches!(self, ReadCapability::Coils | ReadCapability::DiscreteInputs)
    }
}

impl WriteCapability {
    pub fn function_code(self) -> u8 {
        match self {
            WriteCapability::SingleRegister => 0x06,
            WriteCapability::MultipleRegisters => 0x10,
        }
    }

    pub fn from_function_code(code: u8) -> Option<Self> {
        match code {
            0x06 => Some(WriteCapability::SingleRegister),
            0x10 => Some(WriteCapability::MultipleRegisters),
            _ => None,
        }
    }
}

impl TryFrom<CapabilityRepr> for ReadCapability {
    type Error = String;

    fn try_from(repr: CapabilityRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            CapabilityRepr::Code(code) => Self::from_function_code(code)
                .ok_or_else(|| format!("0x{:02X} is not a read function code", code)),
            CapabilityRepr::Name(name) => match name.as_str() {
                "coils" => Ok(ReadCapability::Coils),
                "discrete_inputs" => Ok(ReadCapability::DiscreteInputs),
                "holding_registers" => Ok(ReadCapability::HoldingRegisters),
                "input_registers" => Ok(ReadCapability::InputRegisters),
                other => Err(format!("unknown read capability '{}'", other)),
            },
        }
    }
}

impl TryFrom<CapabilityRepr> for WriteCapability {
    type Error = String;

    fn try_from(repr: CapabilityRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            CapabilityRepr::Code(code) => Self::from_function_code(code)
                .ok_or_else(|| format!("0x{:02X} is not a write function code", code)),
            CapabilityRepr::Name(name) => match name.as_str() {
                "single_register" => Ok(WriteCapability::SingleRegister),
                "multiple_registers" => Ok(WriteCapability::MultipleRegisters),
                other => Err(format!("unknown write capability '{}'", other)),
            },
        }
    }
}

impl fmt::Display for ReadCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fc 0x{:02X}", self.function_code())
    }
}

impl fmt::Display for WriteCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fc 0x{:02X}", self.function_code())
    }
}

fn default_scale() -> f64 {
    1.0
}

/// One row of a device model table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub name: String,

    #[serde(default)]
    pub read: Option<ReadCapability>,

    #[serde(default)]
    pub write: Option<WriteCapability>,

    /// Documented register address (the shift is applied on load)
    pub address: u16,

    #[serde(default = "default_scale")]
    pub scale: f64,

    #[serde(default)]
    pub bias: f64,

    /// Decimal places kept after scaling
    #[serde(default)]
    pub precision: u32,

    /// Raw value written when a write carries no value
    #[serde(default)]
    pub default_write: Option<i64>,
}

fn default_word_increment() -> u16 {
    1
}

fn default_block_span() -> u16 {
    20
}

fn default_read() -> ReadCapability {
    ReadCapability::HoldingRegisters
}

/// On-disk layout of a device model file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,

    /// Registers per value (1..=4)
    #[serde(default = "default_word_increment")]
    pub word_increment: u16,

    /// Offset between documented and wire addresses
    #[serde(default)]
    pub address_shift: i32,

    /// Widest address range one read transaction may cover
    #[serde(default = "default_block_span")]
    pub max_block_span: u16,

    /// Capability used for raw addresses that are not in the table
    #[serde(default = "default_read")]
    pub default_read: ReadCapability,

    pub attributes: Vec<AttributeSpec>,

    #[serde(default)]
    pub derived: Vec<DerivedEntry>,
}

/// Validated register table with wire addresses
#[derive(Debug, Clone)]
pub struct DeviceModel {
    name: String,
    word_increment: u16,
    address_shift: i32,
    max_block_span: u16,
    default_read: ReadCapability,
    attributes: Vec<AttributeSpec>,
    by_name: HashMap<String, usize>,
    by_address: BTreeMap<u16, Vec<usize>>,
}

impl DeviceModel {
    /// Validate a definition and shift every address onto the wire.
    ///
    /// Derived entries are ignored here; see [`DeviceProfile`].
    pub fn new(def: &ModelDefinition) -> Result<Self> {
        let field = format!("models.{}", def.name);
        if def.name.is_empty() {
            return Err(FieldgateError::validation("models", "Model name cannot be empty"));
        }
        if !(1..=4).contains(&def.word_increment) {
            return Err(FieldgateError::validation(
                format!("{}.word_increment", field),
                "Must be between 1 and 4",
            ));
        }
        if def.max_block_span == 0 {
            return Err(FieldgateError::validation(
                format!("{}.max_block_span", field),
                "Must be greater than 0",
            ));
        }

        let mut attributes = Vec::with_capacity(def.attributes.len());
        let mut by_name = HashMap::new();
        let mut by_address: BTreeMap<u16, Vec<usize>> = BTreeMap::new();

        for spec in &def.attributes {
            let key = spec.name.to_ascii_lowercase();
            if spec.name.is_empty() || by_name.contains_key(&key) {
                return Err(FieldgateError::validation(
                    format!("{}.attributes", field),
                    format!("Duplicate or empty attribute name '{}'", spec.name),
                ));
            }
            // A write-only single register occupies one word
            let width = if spec.read.is_none() && spec.write == Some(WriteCapability::SingleRegister) {
                1
            } else {
                def.word_increment
            };
            let address = shift_address(spec.address, def.address_shift, width)
                .ok_or_else(|| {
                    FieldgateError::validation(
                        format!("{}.attributes.{}", field, spec.name),
                        format!(
                            "Address 0x{:04X} overflows the register space after shift {}",
                            spec.address, def.address_shift
                        ),
                    )
                })?;
            let index = attributes.len();
            by_name.insert(key, index);
            by_address.entry(address).or_default().push(index);
            attributes.push(AttributeSpec {
                address,
                ..spec.clone()
            });
        }

        Ok(Self {
            name: def.name.clone(),
            word_increment: def.word_increment,
            address_shift: def.address_shift,
            max_block_span: def.max_block_span,
            default_read: def.default_read,
            attributes,
            by_name,
            by_address,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn word_increment(&self) -> u16 {
        self.word_increment
    }

    pub fn max_block_span(&self) -> u16 {
        self.max_block_span
    }

    pub fn default_read(&self) -> ReadCapability {
        self.default_read
    }

    /// All attributes, in table order, with wire addresses
    pub fn attributes(&self) -> &[AttributeSpec] {
        &self.attributes
    }

    /// Case-insensitive lookup by attribute name
    pub fn lookup_name(&self, name: &str) -> Option<&AttributeSpec> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .map(|&i| &self.attributes[i])
    }

    /// Attributes bound to a wire address, in table order
    pub fn lookup_address(&self, address: u16) -> impl Iterator<Item = &AttributeSpec> {
        self.by_address
            .get(&address)
            .into_iter()
            .flatten()
            .map(|&i| &self.attributes[i])
    }

    /// Map a documented address onto the wire. `None` when it falls outside
    /// the register space.
    pub fn wire_address(&self, documented: u16) -> Option<u16> {
        shift_address(documented, self.address_shift, self.word_increment)
    }
}

/// Apply the shift and check that every word of the value stays addressable
fn shift_address(documented: u16, shift: i32, word_increment: u16) -> Option<u16> {
    let wire = i64::from(documented) + i64::from(shift);
    let last = wire + i64::from(word_increment) - 1;
    if wire < 0 || last > i64::from(u16::MAX) {
        return None;
    }
    u16::try_from(wire).ok()
}

/// A device model together with its derived attributes
#[derive(Debug)]
pub struct DeviceProfile {
    pub model: DeviceModel,
    pub derived: DerivedTable,
}

impl DeviceProfile {
    pub fn new(def: ModelDefinition) -> Result<Self> {
        let model = DeviceModel::new(&def)?;
        let derived = DerivedTable::new(&model, &def.derived)?;
        Ok(Self { model, derived })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let def: ModelDefinition = serde_yaml::from_str(yaml)?;
        Self::new(def)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            FieldgateError::config(format!("Cannot read model file {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents).map_err(|e| {
            FieldgateError::config(format!("Model file {}: {}", path.display(), e))
        })
    }

    pub fn name(&self) -> &str {
        self.model.name()
    }
}

/// Loaded device profiles keyed by model name
#[derive(Debug, Default, Clone)]
pub struct ModelLibrary {
    profiles: HashMap<String, Arc<DeviceProfile>>,
}

impl ModelLibrary {
    /// Load the listed model files from `dir`; an empty list loads every
    /// `*.yaml`/`*.yml` file found there.
    pub fn load(dir: &Path, files: &[String]) -> Result<Self> {
        let logger = get_logger("registers");
        let paths = if files.is_empty() {
            let mut found = Vec::new();
            let entries = std::fs::read_dir(dir).map_err(|e| {
                FieldgateError::config(format!("Cannot list models in {}: {}", dir.display(), e))
            })?;
            for entry in entries {
                let path = entry?.path();
                let is_yaml = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == "yaml" || e == "yml");
                if is_yaml {
                    found.push(path);
                }
            }
            found.sort();
            found
        } else {
            files.iter().map(|f| dir.join(f)).collect()
        };

        let mut library = Self::default();
        for path in paths {
            let profile = DeviceProfile::from_file(&path)?;
            logger.debug(&format!(
                "Loaded model '{}' ({} attributes) from {}",
                profile.name(),
                profile.model.attributes().len(),
                path.display()
            ));
            library.insert(profile)?;
        }
        Ok(library)
    }

    pub fn insert(&mut self, profile: DeviceProfile) -> Result<()> {
        let name = profile.name().to_string();
        if self.profiles.contains_key(&name) {
            return Err(FieldgateError::config(format!(
                "Model '{}' is defined twice",
                name
            )));
        }
        self.profiles.insert(name, Arc::new(profile));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<DeviceProfile>> {
        self.profiles.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(yaml: &str) -> ModelDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_capability_names_and_codes() {
        let def = definition(
            r#"
name: m
attributes:
  - { name: A, read: holding_registers, address: 1 }
  - { name: B, read: 4, address: 2 }
  - { name: C, write: 0x10, address: 3 }
  - { name: D, write: single_register, address: 4 }
"#,
        );
        assert_eq!(def.attributes[0].read, Some(ReadCapability::HoldingRegisters));
        assert_eq!(def.attributes[1].read, Some(ReadCapability::InputRegisters));
        assert_eq!(def.attributes[2].write, Some(WriteCapability::MultipleRegisters));
        assert_eq!(def.attributes[3].write, Some(WriteCapability::SingleRegister));
        assert_eq!(def.attributes[0].scale, 1.0);
    }

    #[test]
    fn test_unknown_function_code_rejected() {
        let res: std::result::Result<ModelDefinition, _> = serde_yaml::from_str(
            "name: m\nattributes:\n  - { name: A, read: 0x05, address: 1 }\n",
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_shift_applied_on_load() {
        let def = definition(
            r#"
name: m
address_shift: 0x100
attributes:
  - { name: Voltage, read: holding_registers, address: 0x10 }
"#,
        );
        let model = DeviceModel::new(&def).unwrap();
        assert_eq!(model.lookup_name("voltage").unwrap().address, 0x110);
        assert_eq!(model.wire_address(0x20), Some(0x120));
        assert_eq!(model.lookup_address(0x110).count(), 1);
    }

    #[test]
    fn test_model_validation() {
        let dup = definition(
            "name: m\nattributes:\n  - { name: A, address: 1 }\n  - { name: a, address: 2 }\n",
        );
        assert!(DeviceModel::new(&dup).is_err());

        let wide = definition("name: m\nword_increment: 5\nattributes: []\n");
        assert!(DeviceModel::new(&wide).is_err());

        let overflow = definition(
            "name: m\nword_increment: 2\nattributes:\n  - { name: A, address: 0xFFFF }\n",
        );
        assert!(DeviceModel::new(&overflow).is_err());

        let negative = definition(
            "name: m\naddress_shift: -2\nattributes:\n  - { name: A, address: 1 }\n",
        );
        assert!(DeviceModel::new(&negative).is_err());
    }

    #[test]
    fn test_library_rejects_duplicate_models() {
        let mut library = ModelLibrary::default();
        let yaml = "name: m\nattributes:\n  - { name: A, address: 1 }\n";
        library.insert(DeviceProfile::from_yaml_str(yaml).unwrap()).unwrap();
        assert!(library.insert(DeviceProfile::from_yaml_str(yaml).unwrap()).is_err());
        assert!(library.get("m").is_some());
        assert_eq!(library.len(), 1);
    }
}
