use crate::domain::Language;
use crate::judge::adapter::LanguageAdapter;
use crate::judge::SANDBOX_WORK_DIR;

#[derive(Debug, Clone, Copy, Default)]
pub struct CppAdapter;

impl LanguageAdapter for CppAdapter {
    fn language(&self) -> Language {
        Language::Cpp
    }

    fn source_file(&self) -> &'static str {
        "code.cpp"
    }

    fn profile_file(&self) -> &'static str {
        "cpp.cfg"
    }

    fn compile_command(&self) -> Option<Vec<String>> {
        Some(vec![
            "/usr/bin/g++".to_string(),
            "-std=c++17".to_string(),
            "-O2".to_string(),
            "-o".to_string(),
            format!("{SANDBOX_WORK_DIR}/program"),
            format!("{SANDBOX_WORK_DIR}/code.cpp"),
        ])
    }

    fn run_command(&self) -> Vec<String> {
        vec![format!("{SANDBOX_WORK_DIR}/program")]
    }
}
