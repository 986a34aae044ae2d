//! Validation and registry verification of RIF tax identifiers.
//!
//! [`identifier`] checks the structure of an identifier without any I/O,
//! [`registry`] asks the external tax registry whether it exists,
//! [`cache`] memoizes those answers and [`validation`] combines everything
//! into the interactive and authoritative flows callers use.

pub mod cache;
pub mod identifier;
pub mod registry;
pub mod request_sharing;
pub mod validation;

pub use self::{
    identifier::{Identifier, InvalidReason, Kind, ValidationOutcome},
    registry::{RegistryGateway, RegistryResult, UnavailableCause},
    validation::{
        AccountDirectory,
        Existence,
        ExistenceError,
        InteractiveCheck,
        LoginError,
        LookupError,
        RegistrationError,
        RetryPolicy,
        Validator,
    },
};
