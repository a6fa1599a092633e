//! A small trait that lets error kinds attach human-readable hints,
//! rendered below the error itself in interactive mode.
pub trait DiagnosableError {
    fn diagnose(&self) -> Vec<String> {
        vec![]
    }
}
