//! Host-facing log and exception reporting

use crate::protocol::{CHANNEL_EXCEPTION, CHANNEL_LOGS};
use crate::transport::Transporter;
use serde::Serialize;
use std::error::Error;

#[derive(Debug, Clone, PartialEq, Serialize)]
struct LogLine<'a> {
    data: &'a str,
}

/// Exception report: the error message plus its source chain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExceptionReport {
    pub message: String,
    pub stack: String,
}

impl ExceptionReport {
    pub fn from_error(err: &(dyn Error + 'static)) -> Self {
        let mut stack = vec![err.to_string()];
        let mut source = err.source();
        while let Some(cause) = source {
            stack.push(format!("caused by: {cause}"));
            source = cause.source();
        }

        Self {
            message: err.to_string(),
            stack: stack.join("\n"),
        }
    }
}

/// Sends host logs and errors to the collector
///
/// Every call is best-effort; the return value tells whether the frame
/// went out.
#[derive(Clone)]
pub struct Notifier {
    transporter: Transporter,
}

impl Notifier {
    pub fn new(transporter: Transporter) -> Self {
        Self { transporter }
    }

    pub async fn log(&self, message: &str) -> bool {
        self.transporter
            .send(CHANNEL_LOGS, LogLine { data: message })
            .await
    }

    pub async fn error(&self, err: &(dyn Error + 'static)) -> bool {
        self.transporter
            .send(CHANNEL_EXCEPTION, ExceptionReport::from_error(err))
            .await
    }
}
