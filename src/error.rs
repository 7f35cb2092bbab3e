use thiserror::Error;

/// A failure observed while executing a job's slices.
///
/// Misusing the scheduler (submitting a job twice, waiting on a port that never got
/// any work, etc.) is a programming error and panics instead.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("slice {slice} panicked: {message}")]
    SlicePanicked { slice: u32, message: String },
    #[error("completion callback panicked: {message}")]
    CallbackPanicked { message: String },
}

impl JobError {
    pub(crate) fn from_panic(slice: u32, payload: &(dyn std::any::Any + Send)) -> Self {
        JobError::SlicePanicked { slice, message: panic_message(payload) }
    }

    pub(crate) fn from_callback_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        JobError::CallbackPanicked { message: panic_message(payload) }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[test]
fn test_panic_messages() {
    let payload: Box<dyn std::any::Any + Send> = Box::new("static message");
    assert_eq!(
        JobError::from_panic(3, &*payload),
        JobError::SlicePanicked { slice: 3, message: "static message".to_string() },
    );

    let payload: Box<dyn std::any::Any + Send> = Box::new(format!("formatted {}", 42));
    assert_eq!(
        JobError::from_callback_panic(&*payload),
        JobError::CallbackPanicked { message: "formatted 42".to_string() },
    );

    let payload: Box<dyn std::any::Any + Send> = Box::new(7u32);
    assert_eq!(
        JobError::from_callback_panic(&*payload).to_string(),
        "completion callback panicked: unknown panic payload",
    );
}
