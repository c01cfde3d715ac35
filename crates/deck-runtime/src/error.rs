use std::fmt;

/// Where a script error happened, recovered from the VM's `chunk:line:` prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub source_name: String,
    pub line: Option<u32>,
    pub message: String,
}

impl ErrorContext {
    pub fn from_message(raw: &str) -> Self {
        let first = raw.lines().next().unwrap_or_default().trim();
        if let Some((source, line, message)) = split_location(first) {
            return ErrorContext {
                source_name: source.to_string(),
                line: Some(line),
                message: message.to_string(),
            };
        }
        ErrorContext {
            source_name: "?".to_string(),
            line: None,
            message: first.to_string(),
        }
    }

    pub fn from_lua_error(err: &mlua::Error) -> Self {
        match err {
            mlua::Error::CallbackError { cause, .. } => ErrorContext::from_lua_error(cause),
            mlua::Error::WithContext { cause, .. } => ErrorContext::from_lua_error(cause),
            mlua::Error::RuntimeError(msg) => ErrorContext::from_message(msg),
            mlua::Error::SyntaxError { message, .. } => ErrorContext::from_message(message),
            mlua::Error::ExternalError(e) => ErrorContext::from_message(&e.to_string()),
            other => ErrorContext::from_message(&other.to_string()),
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: {}", self.source_name, line, self.message),
            None => write!(f, "{}: {}", self.source_name, self.message),
        }
    }
}

/// Splits `source:line: message`, where source may itself contain colons
/// (`[string "a:b"]`, Windows drive letters).
fn split_location(s: &str) -> Option<(&str, u32, &str)> {
    let mut search_from = 0;
    while let Some(rel) = s[search_from..].find(':') {
        let idx = search_from + rel;
        let rest = &s[idx + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits > 0 && rest[digits..].starts_with(':') {
            let line = rest[..digits].parse().ok()?;
            let message = rest[digits + 1..].trim_start();
            return Some((&s[..idx], line, message));
        }
        search_from = idx + 1;
    }
    None
}

#[derive(Debug, thiserror::Error)]
pub enum DeckError {
    #[error("ArgTypeError: {0}")]
    ArgType(String),
    #[error("ArgValueError: {0}")]
    ArgValue(String),
    #[error("ReadonlyKey: {type_name}.{key} is closed for modifications")]
    ReadonlyKey { type_name: &'static str, key: String },
    #[error("TypeError: expected {expected}, got {got}")]
    Type { expected: &'static str, got: String },
    #[error("ModuleNotFound: module {0:?} not found")]
    ModuleNotFound(String),
    #[error("ModuleInvalid: module {name:?} returned {got} instead of a table")]
    ModuleInvalid { name: String, got: String },
    #[error("ScriptLoadError: {0}")]
    ScriptLoad(String),
    #[error("ScriptRuntimeError: {0}")]
    ScriptRuntime(ErrorContext),
    #[error("IOError: {0}")]
    Io(String),
    #[error("TLSHandshakeError: {0}")]
    TlsHandshake(String),
    #[error("ProtocolError: {0}")]
    Protocol(String),
    #[error("TimeoutError: {0}")]
    Timeout(String),
}

impl DeckError {
    pub fn kind(&self) -> &'static str {
        match self {
            DeckError::ArgType(_) => "ArgTypeError",
            DeckError::ArgValue(_) => "ArgValueError",
            DeckError::ReadonlyKey { .. } => "ReadonlyKey",
            DeckError::Type { .. } => "TypeError",
            DeckError::ModuleNotFound(_) => "ModuleNotFound",
            DeckError::ModuleInvalid { .. } => "ModuleInvalid",
            DeckError::ScriptLoad(_) => "ScriptLoadError",
            DeckError::ScriptRuntime(_) => "ScriptRuntimeError",
            DeckError::Io(_) => "IOError",
            DeckError::TlsHandshake(_) => "TLSHandshakeError",
            DeckError::Protocol(_) => "ProtocolError",
            DeckError::Timeout(_) => "TimeoutError",
        }
    }

    pub fn arg_type(msg: impl Into<String>) -> Self {
        DeckError::ArgType(msg.into())
    }

    pub fn arg_value(msg: impl Into<String>) -> Self {
        DeckError::ArgValue(msg.into())
    }

    pub fn readonly(type_name: &'static str, key: &str) -> Self {
        DeckError::ReadonlyKey {
            type_name,
            key: key.to_string(),
        }
    }
}

impl From<DeckError> for mlua::Error {
    fn from(err: DeckError) -> Self {
        mlua::Error::external(err)
    }
}

pub type LuaResult<T> = mlua::Result<T>;
