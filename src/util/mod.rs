//! Utility functions for common operations.
//!
//! - **URL validation**: scheme and SSRF checks for calendar source URLs
//! - **Text processing**: iCalendar unescaping and control-character stripping
//! - **Panic capture**: turning a panic payload into a loggable message

mod text;
mod url_validator;

pub use text::{strip_control_chars, unescape_ics_text};
pub use url_validator::{validate_source_url, UrlValidationError};

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;

/// Extract a readable message from a panic payload.
pub fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(e) = panic.downcast_ref::<Box<dyn std::error::Error + Send>>() {
        e.to_string()
    } else {
        format!("Unknown panic: {:?}", (*panic).type_id())
    }
}

/// Wraps a future to catch panics and convert them to errors.
///
/// Used around each refresh cycle so a bug in one cycle is logged and the
/// background loop keeps running.
///
/// # Returns
///
/// - `Ok(result)` if the future completes normally
/// - `Err(panic_message)` if the future panics
pub async fn catch_task_panic<F, T>(future: F) -> Result<T, String>
where
    F: std::future::Future<Output = T>,
{
    AssertUnwindSafe(future).catch_unwind().await.map_err(panic_message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_catch_task_panic_ok() {
        let result = catch_task_panic(async { 7 }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_catch_task_panic_message() {
        let result: Result<(), String> = catch_task_panic(async { panic!("cycle exploded") }).await;
        assert_eq!(result, Err("cycle exploded".to_string()));
    }

    #[test]
    fn test_panic_message_formatted_string() {
        let payload = std::panic::catch_unwind(|| panic!("value {}", 3)).unwrap_err();
        assert_eq!(panic_message(payload), "value 3");
    }
}
