//! Local documents: plain JSON records that have no revision tree, no
//! sequence and never replicate. Checkpoints live here.

use serde_json::Value;

use trellis_core::error::Result;
use trellis_core::kv::Table;

use crate::store::decode;
use crate::transaction::Transaction;

impl Transaction<'_> {
    pub fn get_local(&self, id: &str) -> Result<Option<Value>> {
        match self.read(Table::Local, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_local(&mut self, id: &str, doc: Value) -> Result<()> {
        self.write(Table::Local, id.as_bytes().to_vec(), serde_json::to_vec(&doc)?);
        Ok(())
    }

    /// Returns whether the document existed.
    pub fn delete_local(&mut self, id: &str) -> Result<bool> {
        let existed = self.read(Table::Local, id.as_bytes())?.is_some();
        if existed {
            self.delete(Table::Local, id.as_bytes().to_vec());
        }
        Ok(existed)
    }
}
