use crate::domain::Language;

/// Adapter contract for language-specific compile/run stages.
pub trait LanguageAdapter: Send + Sync {
    fn language(&self) -> Language;

    /// File name the source code is written to inside the scratch directory.
    fn source_file(&self) -> &'static str;

    /// Sandbox profile file name, resolved under the configured profile
    /// directory.
    fn profile_file(&self) -> &'static str;

    /// Compile command, or `None` for interpreted languages. Paths refer to
    /// the sandbox-internal work directory.
    fn compile_command(&self) -> Option<Vec<String>>;

    /// Wall-clock budget for the compile phase, independent of the job's
    /// own time limit.
    fn compile_time_limit_ms(&self) -> u64 {
        10_000
    }

    fn run_command(&self) -> Vec<String>;
}
