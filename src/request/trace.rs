use std::fmt;

use super::{query_string, Prepared, Request, RequestError, Response};
use crate::trace::{human_bytes, Tracer};
use crate::transport::Headers;

/// Diagnostic report of one request
#[derive(Debug, Clone, Default)]
pub struct RequestTrace {
    pub tracer: Tracer,
    description: String,
    method: String,
    url: String,
    params: String,
    headers: Headers,
    error: Option<String>,
    size: u64,
    status: String,
    status_code: u16,
    response_headers: Headers,
}

impl RequestTrace {
    pub(crate) fn start(request: &Request) -> Self {
        Self {
            tracer: Tracer::started(),
            description: request.description.clone(),
            url: request.url.clone(),
            params: query_string(&request.params),
            headers: request.headers.clone(),
            ..Default::default()
        }
    }

    pub fn stage(&mut self, name: &str) {
        self.tracer.stage(name);
    }

    pub(crate) fn prepared(&mut self, prepared: &Prepared) {
        self.method = prepared.http.method.to_string();
        self.url = prepared.http.url.clone();
    }

    pub(crate) fn response(&mut self, response: &Response) {
        self.size = response.body.len() as u64;
        self.status = response.status_text.clone();
        self.status_code = response.status;
        self.response_headers = response.headers.clone();
    }

    pub(crate) fn error(&mut self, error: &RequestError) {
        self.error = Some(error.to_string());
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

impl fmt::Display for RequestTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Trace for request: {}", self.description)?;
        writeln!(f, "{:>18}: {} {}", "URL", self.method, self.url)?;
        writeln!(f, "{:>18}: {}", "Params", self.params)?;
        writeln!(f, "{:>18}: {:?}", "Header", self.headers)?;
        writeln!(f, "{}", self.tracer)?;
        writeln!(f)?;
        writeln!(f, "{:>18}: {}", "Error", self.error.as_deref().unwrap_or("-"))?;
        writeln!(f, "{:>18}: {}", "Size", human_bytes(self.size))?;
        writeln!(f, "{:>18}: {}", "Status", self.status)?;
        writeln!(f, "{:>18}: {}", "StatusCode", self.status_code)?;
        write!(f, "{:>18}: {:?}", "Response Header", self.response_headers)
    }
}
