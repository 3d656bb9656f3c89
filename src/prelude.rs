pub use std::cmp::Ordering;
pub use std::fs::File;
pub use std::path::{Path, PathBuf};

pub use eyre::{bail, eyre, Result, WrapErr};
pub use tracing::{debug, error, info, trace, warn};

pub use crate::error::StoreError;
pub use crate::rid::Rid;
