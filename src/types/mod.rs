//! # Typed message codec
//!
//! A type is described twice: its *definition* (what a YAML entry or a comm configuration needs to
//! specify the type) and its *metadata* (what a receiver needs to decode one encoded instance).
//! Both are plain JSON objects validated against schemas derived from
//! [`TypeSchema::definition_properties`] and [`TypeSchema::metadata_properties`]. `typename` is
//! always required.
//!
//! [`TypeSchema`] is object safe and covers everything that doesn't touch an instance, so it can be
//! looked up by name from the [`registry`]. [`TypeCodec`] adds the instance-level transforms.

use std::borrow::Cow;
use std::collections::BTreeMap;

use bytes::Bytes;
use serde_json::Value;

use crate::{
    envelope,
    error::TypeError,
    message::{CommMessage, Header},
};

pub use self::builtin::{BytesType, JsonType, Scalar, ScalarType};
pub use self::registry::{get_type, register_type, validate_typedef};
pub use self::schema::{Property, Schema, ValueKind};

mod builtin;
pub mod registry;
pub mod schema;

/// Type definition or encoded metadata. Both share the same shape.
pub type TypeDef = serde_json::Map<String, Value>;

pub const TYPENAME_KEY: &str = "typename";

/// Schema-level contract of a type.
pub trait TypeSchema: Send + Sync + 'static {
    /// Unique type name. Used as the `typename` of every definition and instance.
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str {
        ""
    }

    /// Property schemas, keyed by property name. `typename` is added automatically.
    fn properties(&self) -> BTreeMap<String, Property> {
        BTreeMap::new()
    }

    /// Properties required to describe the type.
    fn definition_properties(&self) -> &'static [&'static str] {
        &[]
    }

    /// Properties required to describe one encoded instance.
    fn metadata_properties(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether the metadata value `v1` may be received where the definition declares `v2`.
    /// `v1` is `None` when the metadata lacks the key.
    fn check_meta_compat(&self, key: &str, v1: Option<&Value>, v2: &Value) -> bool {
        let _ = key;
        v1 == Some(v2)
    }

    fn definition_schema(&self) -> Schema {
        let mut properties = self.properties();
        properties.insert(
            TYPENAME_KEY.into(),
            Property::new(ValueKind::String, "Name of the type encoded.")
                .with_choices([Value::from(self.name())]),
        );

        let mut required: Vec<String> =
            self.definition_properties().iter().map(|x| x.to_string()).collect();
        required.push(TYPENAME_KEY.into());

        Schema {
            title: self.name().into(),
            description: self.description().into(),
            required,
            properties,
        }
    }

    fn metadata_schema(&self) -> Schema {
        let mut out = self.definition_schema();
        out.required = self.metadata_properties().iter().map(|x| x.to_string()).collect();
        out.required.push(TYPENAME_KEY.into());
        out
    }

    fn validate_definition(&self, typedef: &TypeDef) -> Result<(), TypeError> {
        self.definition_schema().validate(typedef).map_err(|reason| self.schema_error(reason))
    }

    fn validate_metadata(&self, metadata: &TypeDef) -> Result<(), TypeError> {
        self.metadata_schema().validate(metadata).map_err(|reason| self.schema_error(reason))
    }

    /// Returns the minimal definition that redescribes the type of an encoded instance.
    fn extract_typedef(&self, metadata: &TypeDef) -> Result<TypeDef, TypeError> {
        let required = self.definition_schema().required;
        let out: TypeDef = metadata
            .iter()
            .filter(|(k, _)| required.iter().any(|r| r == *k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        self.validate_definition(&out)?;
        Ok(out)
    }

    /// Like [`TypeSchema::check_encoded`], but reports why the check failed.
    fn verify_encoded(
        &self,
        metadata: &TypeDef,
        typedef: Option<&TypeDef>,
    ) -> Result<(), TypeError> {
        self.validate_metadata(metadata)?;

        let Some(typedef) = typedef else { return Ok(()) };
        self.validate_definition(typedef)?;

        for (k, v) in typedef {
            if !self.check_meta_compat(k, metadata.get(k), v) {
                return Err(TypeError::Incompatible(k.clone()));
            }
        }

        Ok(())
    }

    fn check_encoded(&self, metadata: &TypeDef, typedef: Option<&TypeDef>) -> bool {
        self.verify_encoded(metadata, typedef).is_ok()
    }

    #[doc(hidden)]
    fn schema_error(&self, reason: String) -> TypeError {
        TypeError::Schema { typename: Cow::Borrowed(self.name()), reason }
    }
}

/// Instance-level contract of a type.
pub trait TypeCodec: TypeSchema {
    type Object: Clone;

    /// Describes an object's type. Fails with [`TypeError::InvalidObject`] for objects this type
    /// can't represent. `typename` is filled in by the caller.
    fn encode_type(&self, obj: &Self::Object) -> Result<TypeDef, TypeError>;

    fn encode_data(&self, obj: &Self::Object, metadata: &TypeDef) -> Result<Bytes, TypeError>;

    fn decode_data(&self, data: &[u8], metadata: &TypeDef) -> Result<Self::Object, TypeError>;

    /// Adjusts an already validated object to the given definition.
    fn transform_type(
        &self,
        obj: Self::Object,
        typedef: Option<&TypeDef>,
    ) -> Result<Self::Object, TypeError> {
        let _ = typedef;
        Ok(obj)
    }

    /// Full metadata of an object, with `typename` set.
    fn metadata_of(&self, obj: &Self::Object) -> Result<TypeDef, TypeError> {
        let mut out = self.encode_type(obj)?;
        out.insert(TYPENAME_KEY.into(), self.name().into());
        Ok(out)
    }

    fn check_decoded(&self, obj: &Self::Object, typedef: Option<&TypeDef>) -> bool {
        match self.metadata_of(obj) {
            Ok(metadata) => self.check_encoded(&metadata, typedef),
            Err(_) => false,
        }
    }

    fn encode(
        &self,
        obj: &Self::Object,
        typedef: Option<&TypeDef>,
    ) -> Result<(TypeDef, Bytes), TypeError> {
        if !self.check_decoded(obj, typedef) {
            return Err(TypeError::InvalidObject(Cow::Borrowed(self.name())));
        }

        let obj = self.transform_type(obj.clone(), typedef)?;
        let metadata = self.metadata_of(&obj)?;
        let data = self.encode_data(&obj, &metadata)?;

        self.verify_encoded(&metadata, typedef)?;
        Ok((metadata, data))
    }

    fn decode(
        &self,
        metadata: &TypeDef,
        data: &[u8],
        typedef: Option<&TypeDef>,
    ) -> Result<Self::Object, TypeError> {
        self.verify_encoded(metadata, typedef)?;

        let obj = self.decode_data(data, metadata)?;
        if !self.check_decoded(&obj, typedef) {
            return Err(TypeError::InvalidObject(Cow::Borrowed(self.name())));
        }

        self.transform_type(obj, typedef)
    }
}

// ========================================================== TypedSerializer ===|

/// Binds a codec to a type definition and produces/consumes envelopes.
#[derive(Debug, Clone)]
pub struct TypedSerializer<C> {
    codec: C,
    typedef: TypeDef,
}

impl<C: TypeCodec> TypedSerializer<C> {
    pub fn new(codec: C) -> Self {
        let mut typedef = TypeDef::new();
        typedef.insert(TYPENAME_KEY.into(), codec.name().into());
        Self { codec, typedef }
    }

    /// Creates a serializer and applies `typedef` through [`Self::update_typedef`]. Keys that are
    /// not definition properties are rejected.
    pub fn with_typedef(codec: C, typedef: TypeDef) -> Result<Self, TypeError> {
        let mut this = Self::new(codec);
        let leftover = this.update_typedef(typedef)?;

        if let Some(key) = leftover.keys().next() {
            return Err(this.codec.schema_error(format!("unknown definition property '{key}'")));
        }

        Ok(this)
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn typedef(&self) -> &TypeDef {
        &self.typedef
    }

    /// Copies every definition property of `update` into the current definition, then
    /// revalidates. Returns the entries that are not definition properties.
    pub fn update_typedef(&mut self, mut update: TypeDef) -> Result<TypeDef, TypeError> {
        if let Some(to) = update.get(TYPENAME_KEY).and_then(Value::as_str) {
            if to != self.codec.name() {
                return Err(TypeError::TypenameChanged {
                    from: self.codec.name().into(),
                    to: to.into(),
                });
            }
        }

        let schema = self.codec.definition_schema();
        let mut next = self.typedef.clone();
        for key in schema.properties.keys() {
            if let Some(v) = update.remove(key) {
                next.insert(key.clone(), v);
            }
        }

        self.codec.validate_definition(&next)?;
        self.typedef = next;

        Ok(update)
    }

    /// Encodes `obj` and wraps it as an envelope. `extra` entries are merged into the header and
    /// override metadata keys of the same name.
    pub fn serialize(&self, obj: &C::Object, extra: Header) -> Result<Bytes, TypeError> {
        let (header, data) = self.encode_parts(obj, extra)?;
        envelope::encode(&header, &data)
    }

    /// Reverses [`Self::serialize`]. A zero-length message yields `(None, {})` without running
    /// the decoder.
    pub fn deserialize(&self, msg: &Bytes) -> Result<(Option<C::Object>, Header), TypeError> {
        if msg.is_empty() {
            return Ok((None, Header::new()));
        }

        let (header, data) = envelope::decode(msg)?;
        let obj = self.codec.decode(&header, &data, Some(&self.typedef))?;

        Ok((Some(obj), header))
    }

    /// Encodes `obj` into a message ready to be handed to a communicator.
    pub fn to_message(&self, obj: &C::Object) -> Result<CommMessage, TypeError> {
        let (header, data) = self.encode_parts(obj, Header::new())?;
        Ok(CommMessage::with_header(data, header))
    }

    /// Decodes a received message. Non-success messages yield the empty sentinel.
    pub fn from_message(&self, msg: &CommMessage) -> Result<Option<C::Object>, TypeError> {
        if !msg.is_success() || (msg.payload.is_empty() && msg.header.is_empty()) {
            return Ok(None);
        }

        self.codec.decode(&msg.header, &msg.payload, Some(&self.typedef)).map(Some)
    }

    fn encode_parts(&self, obj: &C::Object, extra: Header) -> Result<(Header, Bytes), TypeError> {
        let (mut header, data) = self.codec.encode(obj, Some(&self.typedef))?;
        header.extend(extra);
        Ok((header, data))
    }
}
