//! # Settra Types
//!
//! The value algebra of the settings service: every setting carries a typed
//! value domain, and every rule value and default value must conform to it.
//!
//! This crate is **storage-agnostic**: it knows nothing about settings,
//! rules, or HTTP. It only prescribes what value domains exist, when a JSON
//! value inhabits one, and when one domain safely widens into another.
//!
//! ## Architecture
//!
//! ```text
//! ScalarLiteral          ← JSON scalars with JavaScript equality (1 == 1.0)
//!     │
//! LiteralSet             ← Canonical deduplicated Enum/Flag option sets
//!     │
//! ValueType              ← int | float | str | bool | Enum | Flag
//!     │                    | Sequence<T> | Mapping<T>
//! subtype order          ← The partial order gating safe type upgrades
//! ```

pub mod error;
pub mod literal;
pub mod name;
pub mod value_type;
pub mod version;

pub use error::TypeError;
pub use literal::{LiteralSet, ScalarLiteral};
pub use name::{is_valid_metadata_key, is_valid_name};
pub use value_type::ValueType;
pub use version::SettingVersion;
