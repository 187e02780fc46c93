//! Service symbol table.
//!
//! The dispatcher and the client need only a small slice of the IDL: the
//! package, the service name, and for each method its name, message type
//! names and streaming direction. Generated code builds a
//! [`ServiceDescriptor`] from the proto descriptors; hand-written services
//! build one directly.
//!
//! Routes are `[prefix]/<package>.<Service>/<Method>`. Names are matched in
//! their literal IDL spelling first, then in the upper-camel-cased form that
//! older clients send.

/// Streaming direction of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Unary,
    /// Server streaming.
    Download,
    /// Client streaming. Not implemented by the runtime.
    Upload,
    /// Bidirectional streaming. Not implemented by the runtime.
    Bidirectional,
}

impl MethodKind {
    pub fn from_streaming(client_streaming: bool, server_streaming: bool) -> Self {
        match (client_streaming, server_streaming) {
            (false, false) => MethodKind::Unary,
            (false, true) => MethodKind::Download,
            (true, false) => MethodKind::Upload,
            (true, true) => MethodKind::Bidirectional,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            MethodKind::Unary => "unary",
            MethodKind::Download => "download",
            MethodKind::Upload => "upload",
            MethodKind::Bidirectional => "bidirectional",
        }
    }

    /// Whether the runtime can serve and call this kind.
    pub const fn is_supported(self) -> bool {
        matches!(self, MethodKind::Unary | MethodKind::Download)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub input_type: String,
    pub output_type: String,
    pub kind: MethodKind,
}

impl MethodDescriptor {
    pub fn new(
        name: impl Into<String>,
        input_type: impl Into<String>,
        output_type: impl Into<String>,
        kind: MethodKind,
    ) -> Self {
        Self {
            name: name.into(),
            input_type: input_type.into(),
            output_type: output_type.into(),
            kind,
        }
    }

    pub fn unary(name: impl Into<String>, input_type: impl Into<String>, output_type: impl Into<String>) -> Self {
        Self::new(name, input_type, output_type, MethodKind::Unary)
    }

    pub fn server_streaming(
        name: impl Into<String>,
        input_type: impl Into<String>,
        output_type: impl Into<String>,
    ) -> Self {
        Self::new(name, input_type, output_type, MethodKind::Download)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub package: String,
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    /// `package.Service`, or just `Service` for an empty package.
    pub fn fully_qualified_name(&self) -> String {
        qualify(&self.package, &self.name)
    }

    /// `package.CamelService`, the spelling used by camel-casing clients.
    pub fn camel_fully_qualified_name(&self) -> String {
        qualify(&self.package, &camel_case(&self.name))
    }

    /// Base path of the service under `prefix`, with a trailing slash.
    pub fn path_prefix(&self, prefix: &str) -> String {
        format!("{}/{}/", normalize_prefix(prefix), self.fully_qualified_name())
    }

    /// Finds a method by its literal name, then by its camel-cased name.
    pub fn find_method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods
            .iter()
            .find(|m| m.name == name)
            .or_else(|| {
                self.methods
                    .iter()
                    .find(|m| m.name != camel_case(&m.name) && camel_case(&m.name) == name)
            })
    }

    /// Whether a `package.Service` path segment names this service.
    pub fn matches_service(&self, segment: &str) -> bool {
        if segment == self.fully_qualified_name() {
            return true;
        }
        let camel = self.camel_fully_qualified_name();
        camel != self.fully_qualified_name() && segment == camel
    }
}

fn qualify(package: &str, name: &str) -> String {
    if package.is_empty() {
        name.to_string()
    } else {
        format!("{package}.{name}")
    }
}

/// Normalizes a route prefix: empty (or `/`) stays empty, anything else gets
/// exactly one leading slash and no trailing slash.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

/// A request path split into prefix, `package.Service` and method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePath<'a> {
    pub prefix: String,
    pub service: &'a str,
    pub method: &'a str,
}

/// Splits `path` on its last two `/` separators.
pub fn parse_route_path(path: &str) -> Option<RoutePath<'_>> {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() < 3 {
        return None;
    }
    let method = parts[parts.len() - 1];
    let service = parts[parts.len() - 2];
    let prefix = parts[..parts.len() - 2].join("/");
    Some(RoutePath {
        prefix,
        service,
        method,
    })
}

/// Upper camel case as produced by protobuf code generators.
///
/// A leading `_` becomes `X`; an `_` followed by a lower-case letter is
/// dropped and the letter upper-cased; digits are kept; every other letter
/// starting a word is upper-cased and the lower-case run after it copied.
pub fn camel_case(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut i = 0;
    if bytes.first() == Some(&b'_') {
        out.push('X');
        i = 1;
    }
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'_' && bytes.get(i + 1).is_some_and(u8::is_ascii_lowercase) {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() {
            out.push(c as char);
            i += 1;
            continue;
        }
        if c.is_ascii() {
            out.push(c.to_ascii_uppercase() as char);
            i += 1;
        } else {
            // Non-ASCII runs are copied through unchanged.
            let ch = s[i..].chars().next().unwrap_or_default();
            out.push(ch);
            i += ch.len_utf8();
            continue;
        }
        while let Some(&next) = bytes.get(i) {
            if !next.is_ascii_lowercase() {
                break;
            }
            out.push(next as char);
            i += 1;
        }
    }
    out
}
