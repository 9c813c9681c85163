//! Span-export lifetime management.

use opentelemetry_sdk::trace::SdkTracerProvider;

/// Holds the tracer provider and flushes buffered spans on drop, so a
/// graceful shutdown never loses the tail of a trace.
pub struct OtelGuard {
    provider: SdkTracerProvider,
}

impl OtelGuard {
    pub fn new(provider: SdkTracerProvider) -> Self {
        Self { provider }
    }
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(e) = self.provider.shutdown() {
            eprintln!("failed to shut down span exporter: {e}");
        }
    }
}
