pub use cloudlet_types::error::{CloudletError, Result};
