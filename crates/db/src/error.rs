#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("time parse error: {0}")]
    TimeParse(#[from] chrono::ParseError),
    #[error("decimal parse error: {0}")]
    DecimalParse(#[from] rust_decimal::Error),
    #[error("unknown {field} value: {value}")]
    UnknownValue { field: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, DbError>;
