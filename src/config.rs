/// Values fixed once when an `InteropContext` is built.
#[derive(Clone, Debug)]
pub struct InteropConfig {
    /// Added to every documented legacy address.
    pub relocation_offset: isize,
    pub max_hooks: usize,
    /// Bytes reserved per hook table entry. Must fit the hook entry sequence.
    pub hook_entry_size: usize,
    pub max_jump_slots: usize,
    pub jump_slot_size: usize,
    /// How many times a single hook redirect write is tried before giving up.
    ///
    /// Some compatibility layers fail writes to specific code addresses
    /// seemingly at random, retrying gets them through.
    pub write_attempts: u32,
    pub page_size: usize,
    /// Make legacy code pages writable around each patch write. Can be
    /// disabled when the image is mapped RWX for the whole process lifetime.
    pub toggle_code_protection: bool,
}

pub const DEFAULT_WRITE_ATTEMPTS: u32 = 10;

impl Default for InteropConfig {
    fn default() -> InteropConfig {
        InteropConfig {
            relocation_offset: 0,
            max_hooks: 0x400,
            hook_entry_size: 0x80,
            max_jump_slots: 0x100,
            jump_slot_size: 0x10,
            write_attempts: DEFAULT_WRITE_ATTEMPTS,
            page_size: 0x1000,
            toggle_code_protection: true,
        }
    }
}

impl InteropConfig {
    pub fn with_relocation_offset(mut self, offset: isize) -> InteropConfig {
        self.relocation_offset = offset;
        self
    }

    pub fn with_max_hooks(mut self, max_hooks: usize) -> InteropConfig {
        self.max_hooks = max_hooks;
        self
    }

    pub fn with_max_jump_slots(mut self, max_jump_slots: usize) -> InteropConfig {
        self.max_jump_slots = max_jump_slots;
        self
    }

    pub fn with_write_attempts(mut self, attempts: u32) -> InteropConfig {
        self.write_attempts = attempts;
        self
    }

    pub fn with_toggle_code_protection(mut self, toggle: bool) -> InteropConfig {
        self.toggle_code_protection = toggle;
        self
    }
}
