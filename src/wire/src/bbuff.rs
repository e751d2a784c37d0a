//! Append-only byte buffers used to stage collective and RPC payloads.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bbuff {
    data: Vec<u8>,
}

impl Bbuff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Bbuff {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for Bbuff {
    fn from(data: Vec<u8>) -> Self {
        Bbuff { data }
    }
}
