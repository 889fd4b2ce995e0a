//! Typed and dynamic resource representations
//!
//! The state store and the watch machinery carry [`DynamicResource`]s: a
//! metadata header plus an uninterpreted [`serde_json::Value`] spec.
//! Controller code works with [`TypedResource<S>`], where the spec type
//! supplies the kind identity through [`ResourceSpec`]; conversion between
//! the two goes through serde.

use crate::{
    error::{Error, Result},
    metadata::Metadata,
    pointer::{Kind, Pointer},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::Debug;

/// A resource spec type, carrying the kind identity of its resources.
///
/// Implementations are plain serde-able payload structs:
///
/// ```
/// use corral_core::resource::ResourceSpec;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// struct IntSpec {
///     value: i64,
/// }
///
/// impl ResourceSpec for IntSpec {
///     const TYPE: &'static str = "IntegerResource";
///     const NAMESPACE: &'static str = "default";
/// }
/// ```
pub trait ResourceSpec:
    Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The resource type name.
    const TYPE: &'static str;
    /// The default namespace for resources of this type.
    const NAMESPACE: &'static str;

    /// The kind of this resource type in its default namespace.
    #[must_use]
    fn kind() -> Kind {
        Kind::new(Self::NAMESPACE, Self::TYPE)
    }
}

/// A resource with a statically-typed spec.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypedResource<S> {
    /// The metadata header.
    pub metadata: Metadata,
    /// The typed spec payload.
    pub spec: S,
}

impl<S: ResourceSpec> TypedResource<S> {
    /// A fresh, unpersisted resource in the spec's default namespace.
    pub fn new(id: impl Into<String>, spec: S) -> Self {
        Self {
            metadata: Metadata::new(S::NAMESPACE, S::TYPE, id),
            spec,
        }
    }

    /// A fresh resource in an explicit namespace.
    pub fn new_in(namespace: &str, id: impl Into<String>, spec: S) -> Self {
        Self {
            metadata: Metadata::new(namespace, S::TYPE, id),
            spec,
        }
    }

    /// The pointer identifying this resource.
    #[must_use]
    pub fn pointer(&self) -> Pointer {
        self.metadata.pointer()
    }

    /// Erase the spec type, serializing the payload.
    pub fn into_dynamic(self) -> Result<DynamicResource> {
        Ok(DynamicResource {
            metadata: self.metadata,
            spec: serde_json::to_value(self.spec).map_err(Error::Codec)?,
        })
    }
}

impl<S: ResourceSpec> TryFrom<DynamicResource> for TypedResource<S> {
    type Error = Error;

    fn try_from(dynamic: DynamicResource) -> Result<Self> {
        if dynamic.metadata.type_name != S::TYPE {
            return Err(Error::UnexpectedType {
                pointer: dynamic.metadata.pointer(),
                expected: S::TYPE.to_string(),
            });
        }
        Ok(Self {
            spec: serde_json::from_value(dynamic.spec).map_err(Error::Codec)?,
            metadata: dynamic.metadata,
        })
    }
}

/// A resource whose spec is not interpreted.
///
/// This is the representation the state store holds and the watch streams
/// deliver; it works with any resource kind, including kinds not known at
/// compile time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DynamicResource {
    /// The metadata header.
    pub metadata: Metadata,
    /// The raw spec payload.
    pub spec: serde_json::Value,
}

impl DynamicResource {
    /// An empty prototype at the given pointer, used as the `modify`
    /// create-fallback seed.
    #[must_use]
    pub fn prototype(ptr: &Pointer) -> Self {
        Self {
            metadata: Metadata::new(&*ptr.namespace, &*ptr.type_name, &*ptr.id),
            spec: serde_json::Value::Null,
        }
    }

    /// The pointer identifying this resource.
    #[must_use]
    pub fn pointer(&self) -> Pointer {
        self.metadata.pointer()
    }

    /// The kind this resource belongs to.
    #[must_use]
    pub fn kind(&self) -> Kind {
        self.metadata.kind()
    }

    /// Deserialize the spec into a typed view.
    pub fn parse<S: ResourceSpec>(&self) -> Result<TypedResource<S>> {
        TypedResource::try_from(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct IntSpec {
        value: i64,
    }

    impl ResourceSpec for IntSpec {
        const TYPE: &'static str = "IntegerResource";
        const NAMESPACE: &'static str = "default";
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct StrSpec {
        value: String,
    }

    impl ResourceSpec for StrSpec {
        const TYPE: &'static str = "StringResource";
        const NAMESPACE: &'static str = "default";
    }

    #[test]
    fn typed_dynamic_round_trip() {
        let typed = TypedResource::new("one", IntSpec { value: 1 });
        let dynamic = typed.clone().into_dynamic().unwrap();
        assert_eq!(dynamic.pointer(), typed.pointer());
        let back: TypedResource<IntSpec> = dynamic.parse().unwrap();
        assert_eq!(back, typed);
    }

    #[test]
    fn parse_rejects_wrong_kind() {
        let dynamic = TypedResource::new("one", IntSpec { value: 1 })
            .into_dynamic()
            .unwrap();
        let err = dynamic.parse::<StrSpec>().unwrap_err();
        assert!(matches!(err, Error::UnexpectedType { .. }));
    }

    #[test]
    fn prototype_is_unpersisted() {
        let ptr = Pointer::of::<IntSpec>("x");
        let proto = DynamicResource::prototype(&ptr);
        assert_eq!(proto.metadata.version, 0);
        assert_eq!(proto.pointer(), ptr);
    }
}
