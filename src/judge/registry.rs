use crate::domain::Language;
use crate::judge::adapter::LanguageAdapter;
use crate::judge::languages::{cpp::CppAdapter, python::PythonAdapter};

static PYTHON: PythonAdapter = PythonAdapter;
static CPP: CppAdapter = CppAdapter;

pub fn adapter_for(language: Language) -> &'static dyn LanguageAdapter {
    match language {
        Language::Python => &PYTHON,
        Language::Cpp => &CPP,
    }
}
