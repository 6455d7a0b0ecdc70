use serde::Serialize;

/// A row read from a source table.
///
/// Values are kept in the Postgres text representation in column order, `None` standing for
/// `NULL`. Decoding into typed values is left to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRow {
    pub values: Vec<Option<String>>,
}

impl TableRow {
    pub fn new(values: Vec<Option<String>>) -> Self {
        Self { values }
    }

    pub fn value(&self, index: usize) -> Option<&str> {
        self.values.get(index).and_then(|value| value.as_deref())
    }
}
