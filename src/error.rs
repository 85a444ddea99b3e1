use thiserror::Error;

/// Errors raised by each stage of an optimization run.
///
/// Every variant is fatal to the run it occurs in, except `Output` errors
/// raised while persisting an iteration snapshot, which the optimization loop
/// logs and skips.
#[derive(Debug, Error)]
pub enum TopoError {
    /// Malformed problem file or solver configuration
    #[error("Input error: {0}")]
    Input(String),

    /// Malformed mesh: out-of-range node indices, degenerate elements
    #[error("Mesh error: {0}")]
    Mesh(String),

    /// The reduced stiffness system could not be solved
    #[error("Solver error: {0}")]
    Solver(String),

    /// Failure while writing results
    #[error("Output error: {0}")]
    Output(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_stage() {
        let err = TopoError::Solver("no fixed boundary nodes supplied".to_owned());
        assert_eq!(
            err.to_string(),
            "Solver error: no fixed boundary nodes supplied"
        );

        let err = TopoError::Mesh("element 0 has non-positive volume".to_owned());
        assert!(err.to_string().starts_with("Mesh error"));
    }
}
