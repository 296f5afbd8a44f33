use std::{any::Any, panic::UnwindSafe};

use crate::GrammarError;

pub fn mk_panic_error(info: &Box<dyn Any + Send>) -> String {
    let msg = match info.downcast_ref::<&'static str>() {
        Some(s) => *s,
        None => match info.downcast_ref::<String>() {
            Some(s) => &s[..],
            None => "non-string panic!()",
        },
    };

    format!("panic: {msg}")
}

/// Run `f` at the C boundary: both errors and panics come back as a
/// printable message.
pub fn catch_unwind<F, R>(f: F) -> Result<R, String>
where
    F: FnOnce() -> Result<R, GrammarError> + UnwindSafe,
{
    match std::panic::catch_unwind(f) {
        Ok(Ok(r)) => Ok(r),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(mk_panic_error(&e)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errors_and_panics_become_messages() {
        let r: Result<(), String> =
            catch_unwind(|| Err(GrammarError::FrozenState("rejected".to_string())));
        assert_eq!(r.unwrap_err(), "matcher is frozen: rejected");

        let prev = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {}));
        let r: Result<(), String> = catch_unwind(|| panic!("boom"));
        std::panic::set_hook(prev);
        assert_eq!(r.unwrap_err(), "panic: boom");

        assert_eq!(catch_unwind(|| Ok(7)), Ok(7));
    }
}
