//! Log stack initialisation: console/file/socket writer selected by
//! `log-dest`, `EnvFilter` from `log-level`, and an optional OTLP span
//! exporter when a collector URL is configured.

use std::io::Write;
use std::net::{TcpStream, UdpSocket};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use funcd_core::{Error, Result};

use crate::config::Options;
use crate::otel::OtelGuard;

enum Sink {
    Stderr,
    Shared(Arc<Mutex<Box<dyn Write + Send>>>),
}

/// Where log lines go, parsed from the `log-dest` option.
pub struct LogDest {
    sink: Sink,
    prefix: Option<String>,
}

impl LogDest {
    pub fn parse(dest: &str, prefix: Option<String>) -> Result<Self> {
        let sink = match dest {
            "stderr" | "" => Sink::Stderr,
            other => {
                let url = url::Url::parse(other)
                    .map_err(|e| Error::Fatal(format!("log-dest {other:?}: {e}")))?;
                let writer: Box<dyn Write + Send> = match url.scheme() {
                    "file" => {
                        let path = PathBuf::from(url.path());
                        let file = std::fs::OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(&path)
                            .map_err(|e| Error::Fatal(format!("log-dest {}: {e}", path.display())))?;
                        Box::new(file)
                    }
                    "tcp" => {
                        let addr = socket_addr(&url)?;
                        let stream = TcpStream::connect(&addr)
                            .map_err(|e| Error::Fatal(format!("log-dest {addr}: {e}")))?;
                        Box::new(stream)
                    }
                    "udp" => {
                        let addr = socket_addr(&url)?;
                        let socket = UdpSocket::bind("0.0.0.0:0")
                            .and_then(|s| s.connect(&addr).map(|_| s))
                            .map_err(|e| Error::Fatal(format!("log-dest {addr}: {e}")))?;
                        Box::new(UdpWriter(socket))
                    }
                    scheme => {
                        return Err(Error::Fatal(format!("log-dest scheme {scheme:?} not supported")))
                    }
                };
                Sink::Shared(Arc::new(Mutex::new(writer)))
            }
        };
        Ok(Self { sink, prefix })
    }
}

fn socket_addr(url: &url::Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::Fatal(format!("log-dest {url} has no host")))?;
    let port = url
        .port()
        .ok_or_else(|| Error::Fatal(format!("log-dest {url} has no port")))?;
    Ok(format!("{host}:{port}"))
}

/// Each UDP datagram carries one formatted event.
struct UdpWriter(UdpSocket);

impl Write for UdpWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.send(buf).map(|_| buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// MakeWriter over the selected sink. Events buffer in the guard and
/// land in one write (with the configured prefix) when the event ends,
/// so socket destinations see whole lines.
#[derive(Clone)]
pub struct DestWriter {
    shared: Option<Arc<Mutex<Box<dyn Write + Send>>>>,
    prefix: Option<Arc<str>>,
}

pub struct EventGuard {
    shared: Option<Arc<Mutex<Box<dyn Write + Send>>>>,
    prefix: Option<Arc<str>>,
    buf: Vec<u8>,
}

impl Write for EventGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for EventGuard {
    fn drop(&mut self) {
        let mut line = Vec::with_capacity(self.buf.len() + 16);
        if let Some(prefix) = &self.prefix {
            line.extend_from_slice(prefix.as_bytes());
            line.push(b' ');
        }
        line.append(&mut self.buf);
        match &self.shared {
            Some(shared) => {
                if let Ok(mut w) = shared.lock() {
                    // A dead log destination must not take the node down.
                    let _ = w.write_all(&line);
                    let _ = w.flush();
                }
            }
            None => {
                let _ = std::io::stderr().write_all(&line);
            }
        }
    }
}

impl<'a> MakeWriter<'a> for DestWriter {
    type Writer = EventGuard;

    fn make_writer(&'a self) -> Self::Writer {
        EventGuard {
            shared: self.shared.clone(),
            prefix: self.prefix.clone(),
            buf: Vec::new(),
        }
    }
}

/// Initialise the whole stack once. Returns a guard that flushes spans
/// on shutdown when export is enabled.
pub fn init(opts: &Options) -> Result<Option<OtelGuard>> {
    let dest = LogDest::parse(&opts.log_dest, opts.log_prefix.clone())?;
    let writer = DestWriter {
        shared: match dest.sink {
            Sink::Stderr => None,
            Sink::Shared(w) => Some(w),
        },
        prefix: dest.prefix.map(Arc::from),
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&opts.log_level));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(writer);

    // zipkin-url and jaeger-url both feed the OTLP exporter; modern
    // collectors of either family ingest OTLP directly.
    let collector = opts.zipkin_url.as_deref().or(opts.jaeger_url.as_deref());
    match collector {
        Some(endpoint) => {
            use opentelemetry_otlp::WithExportConfig;
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_endpoint(endpoint)
                .build()
                .map_err(|e| Error::Fatal(format!("building span exporter: {e}")))?;
            let resource = Resource::builder()
                .with_attributes(vec![opentelemetry::KeyValue::new(
                    opentelemetry_semantic_conventions::attribute::SERVICE_NAME,
                    "funcd",
                )])
                .build();
            let provider = SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_resource(resource)
                .build();
            let tracer = provider.tracer("funcd");
            Registry::default()
                .with(filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
            Ok(Some(OtelGuard::new(provider)))
        }
        None => {
            Registry::default().with(filter).with(fmt_layer).init();
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_and_urls_parse() {
        assert!(LogDest::parse("stderr", None).is_ok());
        assert!(LogDest::parse("bogus://nowhere", None).is_err());
        assert!(LogDest::parse("not a url", None).is_err());
    }

    #[test]
    fn file_destination_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.log");
        let dest = LogDest::parse(&format!("file://{}", path.display()), Some("fn".into())).unwrap();
        let writer = DestWriter {
            shared: match dest.sink {
                Sink::Shared(w) => Some(w),
                Sink::Stderr => None,
            },
            prefix: dest.prefix.map(Arc::from),
        };
        {
            let mut guard = writer.make_writer();
            guard.write_all(b"hello\n").unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "fn hello\n");
    }
}
