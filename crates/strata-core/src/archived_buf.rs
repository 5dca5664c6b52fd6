use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{archived_root, AlignedVec, Archive, Archived, CheckBytes, Deserialize, Infallible, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Scratch space used when serializing small metadata structures.
pub const SCRATCH_SPACE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archived bytes failed validation: {0}")]
    Invalid(String),
    #[error("failed to serialize archive: {0}")]
    Serialize(String),
}

/// An owned, aligned byte buffer whose contents have been validated as an [`Archived<T>`].
///
/// Bytes coming back from the database have no alignment guarantee, so they are always copied into an [`AlignedVec`]
/// before validation.
pub struct ArchivedBuf<T> {
    bytes: AlignedVec,
    marker: PhantomData<fn() -> T>,
}

impl<T> ArchivedBuf<T>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>>,
{
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ArchiveError> {
        let mut aligned = AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        rkyv::check_archived_root::<T>(&aligned)
            .map_err(|e| ArchiveError::Invalid(e.to_string()))?;
        Ok(Self {
            bytes: aligned,
            marker: PhantomData,
        })
    }

    pub fn serialize(value: &T) -> Result<Self, ArchiveError>
    where
        T: Serialize<AllocSerializer<SCRATCH_SPACE>>,
    {
        let bytes = rkyv::to_bytes::<T, SCRATCH_SPACE>(value)
            .map_err(|e| ArchiveError::Serialize(format!("{:?}", e)))?;
        Ok(Self {
            bytes,
            marker: PhantomData,
        })
    }
}

impl<T: Archive> ArchivedBuf<T> {
    pub fn deserialize(&self) -> T
    where
        T::Archived: Deserialize<T, Infallible>,
    {
        match self.as_ref().deserialize(&mut Infallible) {
            Ok(value) => value,
            Err(_) => unreachable!("BUG: infallible deserializer failed"),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    pub fn take_bytes(self) -> AlignedVec {
        self.bytes
    }
}

impl<T: Archive> AsRef<Archived<T>> for ArchivedBuf<T> {
    fn as_ref(&self) -> &Archived<T> {
        // SAFETY: the bytes were validated (or produced by the serializer) when this buffer was constructed.
        unsafe { archived_root::<T>(self.bytes.as_slice()) }
    }
}

impl<T> fmt::Debug for ArchivedBuf<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchivedBuf")
            .field("len", &self.bytes.len())
            .finish()
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
