use crate::domain::Language;
use crate::judge::adapter::LanguageAdapter;
use crate::judge::SANDBOX_WORK_DIR;

#[derive(Debug, Clone, Copy, Default)]
pub struct PythonAdapter;

impl LanguageAdapter for PythonAdapter {
    fn language(&self) -> Language {
        Language::Python
    }

    fn source_file(&self) -> &'static str {
        "code.py"
    }

    fn profile_file(&self) -> &'static str {
        "python.cfg"
    }

    fn compile_command(&self) -> Option<Vec<String>> {
        None
    }

    fn run_command(&self) -> Vec<String> {
        vec![
            "/usr/bin/python3".to_string(),
            format!("{SANDBOX_WORK_DIR}/code.py"),
        ]
    }
}
