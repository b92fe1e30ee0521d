//! Error handling foundation.
//!
//! Only the `Result` alias lives here. Each crate owns its error enums and
//! layers context onto a `rootcause::Report` as failures cross crate
//! boundaries.

use rootcause::Report;

/// Result alias carrying a rootcause report.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "boom")
        }
    }

    impl std::error::Error for Boom {}

    fn fails() -> Result<(), Boom> {
        Err(Boom.into())
    }

    #[test]
    fn reports_carry_their_context() {
        let err = fails().unwrap_err();
        assert_eq!(err.current_context().to_string(), "boom");
    }
}
