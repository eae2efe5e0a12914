pub mod binding;
pub mod chain;
mod metadata_cipher;

pub use binding::{BindingContext, BoundSignature, BOUND_SIGNATURE_LEN};
pub use metadata_cipher::{MetadataCipher, IV_LEN, SEED_LEN};
