//! Byte encodings for dictionary keys and values.
//!
//! Every supported type encodes to bytes whose lexicographic order matches the
//! type's natural order, and decodes back to exactly the same value. The same
//! body is used for key and value columns; keys additionally carry a one-byte
//! format tag so the key encoding can evolve.
//!
//! | Type | Body |
//! |------|------|
//! | `bool` | `0` / `1` |
//! | unsigned integers | big-endian |
//! | signed integers | big-endian with the sign bit flipped |
//! | `f32`, `f64` | IEEE bits; negatives inverted, positives sign-flipped |
//! | `Uuid` | 16 raw bytes |
//! | `DateTime<Utc>` | sign-flipped `i64` seconds, `u32` nanoseconds (big-endian) |
//! | `Duration` | `u64` seconds, `u32` nanoseconds (big-endian) |
//! | `String` | UTF-8 |
//! | `Vec<u8>` | raw |

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{DbError, DbResult};
use mdbx_base::ColumnType;
use uuid::Uuid;

/// Leading byte of every encoded key.
pub const KEY_TAG: u8 = 0x01;

/// How a Rust type maps onto a physical column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub type_name: &'static str,
    /// Column type when stored as a value.
    pub column_type: ColumnType,
    /// Column type when stored as the key.
    pub key_column_type: ColumnType,
    /// The type has a NULL value.
    pub nullable: bool,
    pub keyable: bool,
    /// False for types whose NULL cannot be told apart from an inner NULL.
    pub storable: bool,
}

impl TypeDescriptor {
    fn fixed(type_name: &'static str, column_type: ColumnType) -> Self {
        Self {
            type_name,
            column_type,
            key_column_type: column_type,
            nullable: false,
            keyable: true,
            storable: true,
        }
    }

    fn variable(type_name: &'static str, key_column_type: ColumnType, column_type: ColumnType) -> Self {
        Self {
            type_name,
            column_type,
            key_column_type,
            nullable: false,
            keyable: true,
            storable: true,
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name)
    }
}

/// A type that can be stored in a dictionary column.
pub trait ColumnValue: Clone + fmt::Debug + Send + Sync + 'static {
    fn descriptor() -> TypeDescriptor;

    /// Appends the order-preserving body. Not called for NULL values.
    fn encode(&self, out: &mut Vec<u8>);

    fn decode(bytes: &[u8]) -> DbResult<Self>;

    fn is_null(&self) -> bool {
        false
    }

    /// The value a NULL column decodes to, if the type has one.
    fn null() -> Option<Self> {
        None
    }
}

fn wrong_width<T>(expected: usize, bytes: &[u8]) -> DbError {
    DbError::Corruption(format!(
        "{} needs {} bytes, found {}",
        std::any::type_name::<T>(),
        expected,
        bytes.len()
    ))
}

fn fixed<const N: usize, T>(bytes: &[u8]) -> DbResult<[u8; N]> {
    bytes.try_into().map_err(|_| wrong_width::<T>(N, bytes))
}

macro_rules! unsigned_column {
    ($($ty:ty => $column:ident),* $(,)?) => {$(
        impl ColumnValue for $ty {
            fn descriptor() -> TypeDescriptor {
                TypeDescriptor::fixed(stringify!($ty), ColumnType::$column)
            }

            fn encode(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_be_bytes());
            }

            fn decode(bytes: &[u8]) -> DbResult<Self> {
                Ok(<$ty>::from_be_bytes(fixed::<{ std::mem::size_of::<$ty>() }, $ty>(bytes)?))
            }
        }
    )*};
}

macro_rules! signed_column {
    ($($ty:ty as $uty:ty => $column:ident),* $(,)?) => {$(
        impl ColumnValue for $ty {
            fn descriptor() -> TypeDescriptor {
                TypeDescriptor::fixed(stringify!($ty), ColumnType::$column)
            }

            fn encode(&self, out: &mut Vec<u8>) {
                let flipped = (*self as $uty) ^ (1 << (<$uty>::BITS - 1));
                out.extend_from_slice(&flipped.to_be_bytes());
            }

            fn decode(bytes: &[u8]) -> DbResult<Self> {
                let raw = <$uty>::from_be_bytes(fixed::<{ std::mem::size_of::<$uty>() }, $ty>(bytes)?);
                Ok((raw ^ (1 << (<$uty>::BITS - 1))) as $ty)
            }
        }
    )*};
}

macro_rules! float_column {
    ($($ty:ty as $uty:ty => $column:ident),* $(,)?) => {$(
        impl ColumnValue for $ty {
            fn descriptor() -> TypeDescriptor {
                TypeDescriptor::fixed(stringify!($ty), ColumnType::$column)
            }

            fn encode(&self, out: &mut Vec<u8>) {
                const SIGN: $uty = 1 << (<$uty>::BITS - 1);
                let bits = self.to_bits();
                let ordered = if bits & SIGN != 0 { !bits } else { bits ^ SIGN };
                out.extend_from_slice(&ordered.to_be_bytes());
            }

            fn decode(bytes: &[u8]) -> DbResult<Self> {
                const SIGN: $uty = 1 << (<$uty>::BITS - 1);
                let ordered = <$uty>::from_be_bytes(fixed::<{ std::mem::size_of::<$uty>() }, $ty>(bytes)?);
                let bits = if ordered & SIGN != 0 { ordered ^ SIGN } else { !ordered };
                Ok(<$ty>::from_bits(bits))
            }
        }
    )*};
}

unsigned_column!(u8 => UnsignedByte, u16 => UnsignedShort, u32 => UnsignedLong, u64 => UnsignedLongLong);
signed_column!(i8 as u8 => SignedByte, i16 as u16 => Short, i32 as u32 => Long, i64 as u64 => LongLong);
float_column!(f32 as u32 => IeeeSingle, f64 as u64 => IeeeDouble);

impl ColumnValue for bool {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::fixed("bool", ColumnType::Bit)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }

    fn decode(bytes: &[u8]) -> DbResult<Self> {
        match fixed::<1, bool>(bytes)? {
            [0] => Ok(false),
            [1] => Ok(true),
            [other] => Err(DbError::Corruption(format!("invalid bool byte {:#04x}", other))),
        }
    }
}

impl ColumnValue for Uuid {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::fixed("Uuid", ColumnType::Guid)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }

    fn decode(bytes: &[u8]) -> DbResult<Self> {
        Ok(Uuid::from_bytes(fixed::<16, Uuid>(bytes)?))
    }
}

impl ColumnValue for DateTime<Utc> {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::fixed("DateTime<Utc>", ColumnType::DateTime)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        self.timestamp().encode(out);
        out.extend_from_slice(&self.timestamp_subsec_nanos().to_be_bytes());
    }

    fn decode(bytes: &[u8]) -> DbResult<Self> {
        let raw = fixed::<12, Self>(bytes)?;
        let secs = i64::decode(&raw[..8])?;
        let nanos = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);
        DateTime::from_timestamp(secs, nanos).ok_or_else(|| {
            DbError::Corruption(format!("timestamp {}s {}ns is out of range", secs, nanos))
        })
    }
}

impl ColumnValue for Duration {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::fixed("Duration", ColumnType::TimeSpan)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.as_secs().to_be_bytes());
        out.extend_from_slice(&self.subsec_nanos().to_be_bytes());
    }

    fn decode(bytes: &[u8]) -> DbResult<Self> {
        let raw = fixed::<12, Self>(bytes)?;
        let secs = u64::decode(&raw[..8])?;
        let nanos = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);
        if nanos >= 1_000_000_000 {
            return Err(DbError::Corruption(format!("duration nanos {} out of range", nanos)));
        }
        Ok(Duration::new(secs, nanos))
    }
}

impl ColumnValue for String {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::variable("String", ColumnType::Text, ColumnType::LongText)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }

    fn decode(bytes: &[u8]) -> DbResult<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DbError::Corruption(format!("text column is not UTF-8: {}", e)))
    }
}

impl ColumnValue for Vec<u8> {
    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::variable("Vec<u8>", ColumnType::Binary, ColumnType::LongBinary)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn decode(bytes: &[u8]) -> DbResult<Self> {
        Ok(bytes.to_vec())
    }
}

/// Nullable values. Not usable as keys, and `Option<Option<T>>` is rejected
/// when the schema is derived.
impl<T: ColumnValue> ColumnValue for Option<T> {
    fn descriptor() -> TypeDescriptor {
        let inner = T::descriptor();
        TypeDescriptor {
            type_name: std::any::type_name::<Self>(),
            column_type: inner.column_type,
            key_column_type: inner.key_column_type,
            nullable: true,
            keyable: false,
            storable: inner.storable && !inner.nullable,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        if let Some(value) = self {
            value.encode(out);
        }
    }

    fn decode(bytes: &[u8]) -> DbResult<Self> {
        T::decode(bytes).map(Some)
    }

    fn is_null(&self) -> bool {
        self.is_none()
    }

    fn null() -> Option<Self> {
        Some(None)
    }
}

/// Encodes a dictionary key: tag byte plus body.
pub fn encode_key<K: ColumnValue>(key: &K) -> Vec<u8> {
    let mut out = Vec::with_capacity(17);
    out.push(KEY_TAG);
    key.encode(&mut out);
    out
}

pub fn decode_key<K: ColumnValue>(bytes: &[u8]) -> DbResult<K> {
    match bytes.split_first() {
        Some((&KEY_TAG, body)) => K::decode(body),
        Some((tag, _)) => Err(DbError::Corruption(format!("unknown key format tag {:#04x}", tag))),
        None => Err(DbError::Corruption("empty key".into())),
    }
}

/// Encodes a value column; `None` is NULL.
pub fn encode_value<V: ColumnValue>(value: &V) -> Option<Vec<u8>> {
    if value.is_null() {
        return None;
    }
    let mut out = Vec::new();
    value.encode(&mut out);
    Some(out)
}

pub fn decode_value<V: ColumnValue>(bytes: Option<&[u8]>) -> DbResult<V> {
    match bytes {
        Some(bytes) => V::decode(bytes),
        None => V::null().ok_or_else(|| {
            DbError::Corruption(format!("NULL stored for non-nullable {}", V::descriptor()))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cmp::Ordering;

    fn round_trip<T: ColumnValue + PartialEq>(value: T) {
        let key = encode_key(&value);
        assert_eq!(decode_key::<T>(&key).unwrap(), value);
        let stored = encode_value(&value);
        assert_eq!(decode_value::<T>(stored.as_deref()).unwrap(), value);
    }

    fn key_order<T: ColumnValue>(a: &T, b: &T) -> Ordering {
        encode_key(a).cmp(&encode_key(b))
    }

    #[test]
    fn test_fixed_widths_match_column_types() {
        fn check<T: ColumnValue>(value: T) {
            let width = T::descriptor().column_type.fixed_size();
            assert_eq!(encode_value(&value).map(|v| v.len()), width, "{}", T::descriptor());
        }
        check(true);
        check(7u8);
        check(7u16);
        check(7u32);
        check(7u64);
        check(-7i8);
        check(-7i16);
        check(-7i32);
        check(-7i64);
        check(1.5f32);
        check(1.5f64);
        check(Uuid::nil());
        check(Utc::now());
        check(Duration::from_millis(1500));
    }

    #[test]
    fn test_edge_values_round_trip() {
        round_trip(i64::MIN);
        round_trip(i64::MAX);
        round_trip(u64::MAX);
        round_trip(-0.0f64);
        round_trip(f64::NEG_INFINITY);
        round_trip(String::new());
        round_trip(Vec::<u8>::new());
        round_trip(Duration::MAX);
        round_trip(DateTime::<Utc>::MIN_UTC);
        round_trip(DateTime::<Utc>::MAX_UTC);
        round_trip(Some(5i32));
        round_trip(None::<i32>);

        let nan = f64::from_bits(0x7ff8_0000_0000_1234);
        let back = decode_key::<f64>(&encode_key(&nan)).unwrap();
        assert_eq!(back.to_bits(), nan.to_bits());
    }

    #[test]
    fn test_signed_and_float_ordering() {
        assert_eq!(key_order(&-1i32, &0i32), Ordering::Less);
        assert_eq!(key_order(&i32::MIN, &i32::MAX), Ordering::Less);
        assert_eq!(key_order(&-2.5f64, &-1.0f64), Ordering::Less);
        assert_eq!(key_order(&-0.0f64, &0.0f64), Ordering::Less);
        assert_eq!(key_order(&f64::NEG_INFINITY, &f64::MIN), Ordering::Less);
        assert_eq!(key_order(&false, &true), Ordering::Less);
    }

    #[test]
    fn test_null_handling() {
        assert_eq!(encode_value(&None::<String>), None);
        assert_eq!(decode_value::<Option<String>>(None).unwrap(), None);
        assert!(matches!(decode_value::<String>(None), Err(DbError::Corruption(_))));

        let outer = <Option<Option<u8>>>::descriptor();
        assert!(!outer.storable);
        assert!(!outer.keyable);
        assert!(<Option<u8>>::descriptor().storable);
    }

    #[test]
    fn test_malformed_bytes_are_corruption() {
        assert!(matches!(decode_key::<u32>(&[]), Err(DbError::Corruption(_))));
        assert!(matches!(decode_key::<u32>(&[0x02, 0, 0, 0, 1]), Err(DbError::Corruption(_))));
        assert!(matches!(u32::decode(&[1, 2]), Err(DbError::Corruption(_))));
        assert!(matches!(bool::decode(&[2]), Err(DbError::Corruption(_))));
        assert!(matches!(String::decode(&[0xff, 0xfe]), Err(DbError::Corruption(_))));
        assert!(matches!(
            Duration::decode(&[0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]),
            Err(DbError::Corruption(_))
        ));
    }

    #[test]
    fn test_descriptors() {
        assert_eq!(String::descriptor().key_column_type, ColumnType::Text);
        assert_eq!(String::descriptor().column_type, ColumnType::LongText);
        assert_eq!(<Vec<u8>>::descriptor().key_column_type, ColumnType::Binary);
        assert_eq!(<Vec<u8>>::descriptor().column_type, ColumnType::LongBinary);
        assert_eq!(i16::descriptor().column_type, ColumnType::Short);
        assert_eq!(u16::descriptor().column_type, ColumnType::UnsignedShort);
    }

    fn datetime() -> impl Strategy<Value = DateTime<Utc>> {
        let min = DateTime::<Utc>::MIN_UTC.timestamp();
        let max = DateTime::<Utc>::MAX_UTC.timestamp();
        (min..max, 0u32..1_000_000_000)
            .prop_map(|(secs, nanos)| DateTime::from_timestamp(secs, nanos).unwrap())
    }

    proptest! {
        #[test]
        fn prop_integers_round_trip_and_order(a in any::<i64>(), b in any::<i64>(), c in any::<u32>(), d in any::<u32>()) {
            round_trip(a);
            round_trip(c);
            prop_assert_eq!(key_order(&a, &b), a.cmp(&b));
            prop_assert_eq!(key_order(&c, &d), c.cmp(&d));
            prop_assert_eq!(key_order(&(a as i8), &(b as i8)), (a as i8).cmp(&(b as i8)));
            prop_assert_eq!(key_order(&(c as u16), &(d as u16)), (c as u16).cmp(&(d as u16)));
        }

        #[test]
        fn prop_floats_follow_total_order(a in any::<f64>(), b in any::<f64>(), x in any::<f32>(), y in any::<f32>()) {
            prop_assert_eq!(decode_key::<f64>(&encode_key(&a)).unwrap().to_bits(), a.to_bits());
            prop_assert_eq!(key_order(&a, &b), a.total_cmp(&b));
            prop_assert_eq!(key_order(&x, &y), x.total_cmp(&y));
        }

        #[test]
        fn prop_text_and_bytes(a in ".*", b in ".*", x in prop::collection::vec(any::<u8>(), 0..64), y in prop::collection::vec(any::<u8>(), 0..64)) {
            round_trip(a.clone());
            round_trip(x.clone());
            prop_assert_eq!(key_order(&a, &b), a.cmp(&b));
            prop_assert_eq!(key_order(&x, &y), x.cmp(&y));
        }

        #[test]
        fn prop_time_types(a in datetime(), b in datetime(), s in any::<u64>(), n in 0u32..1_000_000_000, t in any::<u64>()) {
            round_trip(a);
            prop_assert_eq!(key_order(&a, &b), a.cmp(&b));
            let d1 = Duration::new(s, n);
            let d2 = Duration::new(t, 0);
            round_trip(d1);
            prop_assert_eq!(key_order(&d1, &d2), d1.cmp(&d2));
        }

        #[test]
        fn prop_uuids(a in any::<u128>(), b in any::<u128>()) {
            let (a, b) = (Uuid::from_u128(a), Uuid::from_u128(b));
            round_trip(a);
            prop_assert_eq!(key_order(&a, &b), a.cmp(&b));
        }
    }
}
