use xlat_block_map::BlockMapConfig;
use xlat_exec_mem::ExecMemConfig;

use crate::error::{ContextError, Result};

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Whether the context owns an executable allocator and block map. Interpreter-only contexts
    /// turn this off.
    pub code_cache: bool,
    pub exec: ExecMemConfig,
    pub blocks: BlockMapConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            code_cache: true,
            exec: ExecMemConfig::default(),
            blocks: BlockMapConfig::default(),
        }
    }
}

impl ContextConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.code_cache {
            return Ok(());
        }
        self.exec.validate()?;
        self.blocks.validate()?;
        // Guest code addresses double as host addresses for page protection.
        if self.blocks.guest_address_bits > usize::BITS {
            return Err(ContextError::InvalidConfig(
                "guest address space is wider than the host's",
            ));
        }
        Ok(())
    }
}
