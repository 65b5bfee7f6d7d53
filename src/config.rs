//! The passive configuration record of `spec.md` §6, plus a builder in the
//! style of `ykrt::mt::MTBuilder` (chained setters consumed into an
//! immutable value).

/// Tool-wide options. Never parsed from a command line by this crate
/// (option parsing is out of scope, `spec.md` §1); the host constructs one
/// of these however it likes and hands it to [`crate::Context::new`].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub track_heap: bool,
    pub redzone_size: u64,
    pub size_in_redzone: bool,
    pub leaks_only: bool,
    pub shadowing: bool,
    pub delay_frees: usize,
    pub stack_swap_threshold: u64,
    pub warn_null_ptr: bool,
    pub check_leaks_on_destroy: bool,
    pub count_leaks: bool,
    pub midchunk_new_ok: bool,
    pub midchunk_inheritance_ok: bool,
    pub midchunk_string_ok: bool,
    pub midchunk_size_ok: bool,
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/// Builds a [`Config`] with the tool's defaults, overridden one field at a
/// time.
pub struct ConfigBuilder {
    cfg: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            cfg: Config {
                track_heap: true,
                redzone_size: 16,
                size_in_redzone: false,
                leaks_only: false,
                shadowing: true,
                delay_frees: 2000,
                stack_swap_threshold: 0x10000,
                warn_null_ptr: false,
                check_leaks_on_destroy: true,
                count_leaks: true,
                midchunk_new_ok: false,
                midchunk_inheritance_ok: false,
                midchunk_string_ok: false,
                midchunk_size_ok: false,
            },
        }
    }

    pub fn build(self) -> Config {
        self.cfg
    }

    pub fn track_heap(mut self, v: bool) -> Self {
        self.cfg.track_heap = v;
        self
    }

    pub fn redzone_size(mut self, v: u64) -> Self {
        self.cfg.redzone_size = v;
        self
    }

    pub fn size_in_redzone(mut self, v: bool) -> Self {
        self.cfg.size_in_redzone = v;
        self
    }

    pub fn leaks_only(mut self, v: bool) -> Self {
        self.cfg.leaks_only = v;
        self
    }

    pub fn shadowing(mut self, v: bool) -> Self {
        self.cfg.shadowing = v;
        self
    }

    pub fn delay_frees(mut self, v: usize) -> Self {
        self.cfg.delay_frees = v;
        self
    }

    pub fn stack_swap_threshold(mut self, v: u64) -> Self {
        self.cfg.stack_swap_threshold = v;
        self
    }

    pub fn warn_null_ptr(mut self, v: bool) -> Self {
        self.cfg.warn_null_ptr = v;
        self
    }

    pub fn check_leaks_on_destroy(mut self, v: bool) -> Self {
        self.cfg.check_leaks_on_destroy = v;
        self
    }

    pub fn count_leaks(mut self, v: bool) -> Self {
        self.cfg.count_leaks = v;
        self
    }

    pub fn midchunk_new_ok(mut self, v: bool) -> Self {
        self.cfg.midchunk_new_ok = v;
        self
    }

    pub fn midchunk_inheritance_ok(mut self, v: bool) -> Self {
        self.cfg.midchunk_inheritance_ok = v;
        self
    }

    pub fn midchunk_string_ok(mut self, v: bool) -> Self {
        self.cfg.midchunk_string_ok = v;
        self
    }

    pub fn midchunk_size_ok(mut self, v: bool) -> Self {
        self.cfg.midchunk_size_ok = v;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_enables_shadowing_and_heap_tracking() {
        let cfg = Config::default();
        assert!(cfg.shadowing);
        assert!(cfg.track_heap);
        assert_eq!(cfg.redzone_size, 16);
    }

    #[test]
    fn builder_overrides_only_requested_fields() {
        let cfg = ConfigBuilder::new().delay_frees(4).redzone_size(0).build();
        assert_eq!(cfg.delay_frees, 4);
        assert_eq!(cfg.redzone_size, 0);
        assert!(cfg.shadowing);
    }
}
