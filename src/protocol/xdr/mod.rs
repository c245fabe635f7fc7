//! XDR is a standard for the description and encoding of data.
//! It is useful for transferring data between different computer
//! architectures, and every message this crate puts on the wire is
//! expressed in it.
//!
//! <https://datatracker.ietf.org/doc/html/rfc4506>
//!
//! Its Rust-specific implementation is presented below.
//! Where appropriate, the standard types of the XDR language have
//! been replaced by similar types of the Rust language. For example,
//! the 32-bit `int` type was replaced by the `i32` type, and the
//! unbounded `opaque<>` type was replaced by `[u8]`. Declarations with an
//! explicit maximum (`opaque x<MAX>`, `string x<MAX>`, `T x<MAX>`) map to
//! [`Opaque`], [`XdrString`] and [`BoundedVec`], which refuse to encode or
//! decode anything longer than the declared bound.
//!
//! Every variable-length item is followed by zero padding up to a four
//! byte boundary, and a zero length prefix is a valid, empty item.

use std::io::{Read, Write};

use byteorder::BigEndian;
use byteorder::{ReadBytesExt, WriteBytesExt};
use num_traits::{FromPrimitive, ToPrimitive};

pub mod portmap;
pub mod rpc;
pub(crate) mod utils;

/// XDR assumes big endian encoding.
pub type XDREndian = BigEndian;

pub trait Serialize {
    /// Serializes the implementing type to the provided writer.
    ///
    /// ## Parameters
    /// * `dest` - Where will the value be serialized to.
    ///
    /// ## Returns
    /// * `std::io::Result<()>` - Ok(()) on success, or an error if serialization fails.
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()>;
}

pub trait Deserialize {
    /// Deserializes data from the provided reader into the implementing type.
    ///
    /// ## Parameters
    /// * `src` - From where the value will be deserialized.
    ///
    /// ## Returns
    /// * `std::io::Result<()>` - Ok(()) on success, or an error if deserialization fails.
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()>;
}

/// Deserialization based on the [Default] trait of the type T.
pub fn deserialize<T>(src: &mut impl Read) -> std::io::Result<T>
where
    T: Deserialize + Default,
{
    let mut val = T::default();
    val.deserialize(src)?;

    Ok(val)
}

/// Serializes `value` into a fresh buffer.
///
/// Nothing is returned on failure, so a caller can never observe a
/// partially encoded message.
pub fn to_bytes<T: Serialize + ?Sized>(value: &T) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    value.serialize(&mut buf)?;
    Ok(buf)
}

/// Marker trait for XDR `enum` type serialization.
pub trait SerializeEnum: ToPrimitive {}

/// Enumerations have the same representation as signed integers.
impl<T: SerializeEnum> Serialize for T {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        if let Some(val) = self.to_i32() {
            return dest.write_i32::<XDREndian>(val);
        }
        Err(utils::invalid_data("Invalid enum value"))
    }
}

/// Marker trait for XDR `enum` type deserialization.
pub trait DeserializeEnum: FromPrimitive {}

/// Enumerations have the same representation as signed integers.
impl<T: DeserializeEnum> Deserialize for T {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let val = src.read_i32::<XDREndian>()?;
        if let Some(val) = FromPrimitive::from_i32(val) {
            *self = val;
            return Ok(());
        }

        Err(utils::invalid_data("Invalid enum value"))
    }
}

/// XDR `void`: occupies no space on the wire.
impl Serialize for () {
    fn serialize<W: Write>(&self, _dest: &mut W) -> std::io::Result<()> {
        Ok(())
    }
}

impl Deserialize for () {
    fn deserialize<R: Read>(&mut self, _src: &mut R) -> std::io::Result<()> {
        Ok(())
    }
}

/// XDR `bool` is an `enum { FALSE = 0, TRUE = 1 }`, i.e. an `i32` on the wire.
impl Serialize for bool {
    fn serialize<R: Write>(&self, dest: &mut R) -> std::io::Result<()> {
        dest.write_i32::<XDREndian>(if *self { 1 } else { 0 })
    }
}

impl Deserialize for bool {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        match src.read_i32::<XDREndian>()? {
            0 => *self = false,
            1 => *self = true,
            _ => return Err(utils::invalid_data("Invalid value for bool enum")),
        }
        Ok(())
    }
}

/// Implements the codec for a fixed-size numeric type in terms of the
/// matching `byteorder` accessors.
macro_rules! xdr_scalar {
    ($t:ty, $write:ident, $read:ident, $xdr:literal) => {
        #[doc = concat!("XDR `", $xdr, "` type.")]
        impl Serialize for $t {
            fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
                dest.$write::<XDREndian>(*self)
            }
        }

        impl Deserialize for $t {
            fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
                *self = src.$read::<XDREndian>()?;
                Ok(())
            }
        }
    };
}

xdr_scalar!(i32, write_i32, read_i32, "int");
xdr_scalar!(u32, write_u32, read_u32, "unsigned int");
xdr_scalar!(i64, write_i64, read_i64, "hyper");
xdr_scalar!(u64, write_u64, read_u64, "unsigned hyper");
xdr_scalar!(f32, write_f32, read_f32, "float");
xdr_scalar!(f64, write_f64, read_f64, "double");

/// XDR Fixed-Length Opaque Data (`opaque identifier[n];`).
impl<const N: usize> Serialize for [u8; N] {
    fn serialize<R: Write>(&self, dest: &mut R) -> std::io::Result<()> {
        dest.write_all(self)?;
        utils::write_padding(N, dest)
    }
}

impl<const N: usize> Deserialize for [u8; N] {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        src.read_exact(self)?;
        utils::read_padding(N, src)
    }
}

/// Object lengths in XDR are always serialized as [u32]. This wrapper
/// type provides a way to serialize the [usize] type common to Rust as [u32].
#[derive(Default)]
struct UsizeAsU32(usize);

impl Serialize for UsizeAsU32 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        let Some(val) = self.0.to_u32() else {
            return Err(utils::invalid_data("cannot cast `usize` to `u32`"));
        };

        val.serialize(dest)
    }
}

impl Deserialize for UsizeAsU32 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let Some(val) = deserialize::<u32>(src)?.to_usize() else {
            return Err(utils::invalid_data("cannot cast `u32` to `usize`"));
        };

        self.0 = val;
        Ok(())
    }
}

/// XDR Variable-Length Opaque Data (`opaque identifier<>;`).
impl Serialize for [u8] {
    fn serialize<R: Write>(&self, dest: &mut R) -> std::io::Result<()> {
        UsizeAsU32(self.len()).serialize(dest)?;
        dest.write_all(self)?;
        utils::write_padding(self.len(), dest)
    }
}

impl Deserialize for Vec<u8> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let length = deserialize::<UsizeAsU32>(src)?.0;
        utils::read_opaque(length, self, src)
    }
}

/// XDR String serialization implementation.
impl Serialize for str {
    fn serialize<R: Write>(&self, dest: &mut R) -> std::io::Result<()> {
        self.as_bytes().serialize(dest)
    }
}

/// XDR String deserialization implementation.
impl Deserialize for String {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let mut bytes = std::mem::take(self).into_bytes();
        bytes.deserialize(src)?;
        // XDR String is always ascii
        if !bytes.is_ascii() {
            return Err(utils::invalid_data("Not ASCII string"));
        }
        *self = String::from_utf8(bytes).map_err(|_| utils::invalid_data("Not ASCII string"))?;

        Ok(())
    }
}

/// XDR Fixed-Length Array (`T identifier[n];`).
impl<const N: usize, T: Serialize> Serialize for [T; N] {
    fn serialize<R: Write>(&self, dest: &mut R) -> std::io::Result<()> {
        for i in self {
            i.serialize(dest)?;
        }

        Ok(())
    }
}

impl<const N: usize, T: Deserialize> Deserialize for [T; N] {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        for i in self {
            i.deserialize(src)?;
        }

        Ok(())
    }
}

/// XDR Variable-Length Array (`T identifier<>;`): a length prefix followed
/// by that many elements.
impl<T: Serialize> Serialize for [T] {
    fn serialize<R: Write>(&self, dest: &mut R) -> std::io::Result<()> {
        UsizeAsU32(self.len()).serialize(dest)?;
        for i in self {
            i.serialize(dest)?;
        }

        Ok(())
    }
}

impl<T: Deserialize + Default> Deserialize for Vec<T> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let length = deserialize::<UsizeAsU32>(src)?.0;
        self.clear();
        // every element takes at least one byte, so a bogus length runs out of input
        // long before it runs out of memory
        self.reserve(utils::prealloc_hint(length));
        for _ in 0..length {
            self.push(deserialize::<T>(src)?);
        }
        Ok(())
    }
}

fn check_bound(length: usize, max: usize) -> std::io::Result<()> {
    if length > max {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("length {length} exceeds declared maximum {max}"),
        ));
    }
    Ok(())
}

/// XDR Variable-Length Opaque Data with a declared maximum
/// (`opaque identifier<MAX>;`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Opaque<const MAX: usize>(pub Vec<u8>);

impl<const MAX: usize> Serialize for Opaque<MAX> {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        check_bound(self.0.len(), MAX)?;
        self.0.serialize(dest)
    }
}

impl<const MAX: usize> Deserialize for Opaque<MAX> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let length = deserialize::<UsizeAsU32>(src)?.0;
        check_bound(length, MAX)?;
        utils::read_opaque(length, &mut self.0, src)
    }
}

/// XDR String with a declared maximum (`string identifier<MAX>;`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct XdrString<const MAX: usize>(pub String);

impl<const MAX: usize> Serialize for XdrString<MAX> {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        check_bound(self.0.len(), MAX)?;
        self.0.serialize(dest)
    }
}

impl<const MAX: usize> Deserialize for XdrString<MAX> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let mut raw = Opaque::<MAX>(std::mem::take(&mut self.0).into_bytes());
        raw.deserialize(src)?;
        if !raw.0.is_ascii() {
            return Err(utils::invalid_data("Not ASCII string"));
        }
        self.0 = String::from_utf8(raw.0).map_err(|_| utils::invalid_data("Not ASCII string"))?;
        Ok(())
    }
}

/// XDR Variable-Length Array with a declared maximum (`T identifier<MAX>;`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BoundedVec<T, const MAX: usize>(pub Vec<T>);

impl<T: Serialize, const MAX: usize> Serialize for BoundedVec<T, MAX> {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        check_bound(self.0.len(), MAX)?;
        self.0.serialize(dest)
    }
}

impl<T: Deserialize + Default, const MAX: usize> Deserialize for BoundedVec<T, MAX> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let length = deserialize::<UsizeAsU32>(src)?.0;
        check_bound(length, MAX)?;
        self.0.clear();
        self.0.reserve(utils::prealloc_hint(length));
        for _ in 0..length {
            self.0.push(deserialize::<T>(src)?);
        }
        Ok(())
    }
}

/// Macro for implementing XDR serialization for structs.
///
/// This macro simplifies implementation of the XDR trait for struct types
/// by serializing each field in sequence.
#[allow(non_camel_case_types)]
#[macro_export]
macro_rules! SerializeStruct {
    (
        $t:ident,
        $($element:ident),*
    ) => {
        impl Serialize for $t {
            fn serialize<R: Write>(&self, dest: &mut R) -> std::io::Result<()> {
                $(self.$element.serialize(dest)?;)*
                Ok(())
            }
        }
    };
}

/// Counterpart of [`SerializeStruct!`]: deserializes each field in sequence.
#[allow(non_camel_case_types)]
#[macro_export]
macro_rules! DeserializeStruct {
    (
        $t:ident,
        $($element:ident),*
    ) => {
        impl Deserialize for $t {
            fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
                $(self.$element.deserialize(src)?;)*
                Ok(())
            }
        }
    };
}

// XDR Optional-Data (`T *identifier;`).
impl<T: Serialize> Serialize for Option<T> {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        match self {
            Some(data) => {
                true.serialize(dest)?;
                data.serialize(dest)
            }
            None => false.serialize(dest),
        }
    }
}

impl<T: Deserialize + Default> Deserialize for Option<T> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        if deserialize::<bool>(src)? {
            *self = Some(deserialize::<T>(src)?);
        } else {
            *self = None;
        }

        Ok(())
    }
}

// Re-export public types for use in other modules
pub use crate::DeserializeStruct;
pub use crate::SerializeStruct;
