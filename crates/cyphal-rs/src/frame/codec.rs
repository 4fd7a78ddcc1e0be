use crate::hal::CyphalError;

/// A trait for wire structures that can be serialized into and
/// deserialized from a byte buffer.
pub trait Codec: Sized {
    /// Serializes the object into the provided buffer and returns the
    /// number of bytes written.
    fn serialize(&self, buffer: &mut [u8]) -> Result<usize, CyphalError>;

    /// Deserializes an object from the provided buffer.
    fn deserialize(buffer: &[u8]) -> Result<Self, CyphalError>;
}
