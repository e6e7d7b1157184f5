use anyhow::{format_err, Result};

fn main() -> Result<()> {
    shadow_rs::new().map_err(|e| format_err!("inject build-time variables: {:?}", e))
}
