//! Component type registration and stable type identity.
//!
//! Every component type is registered explicitly in a [`ComponentRegistry`]
//! owned by one [`World`](crate::world::World). Registration produces a typed
//! [`ComponentHandle`] whose [`ComponentTypeId`] is derived from a content hash
//! of the type's defining module and name, never from registration order. Two
//! processes that register the same component set therefore agree on every id
//! without talking to each other, and [`ComponentManifest`] lets them prove it.
//!
//! Components are plain-old-data (`bytemuck::Pod`). Storage moves them by
//! byte copy, and command buffers carry them as byte images.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::EcsError;

// ---------------------------------------------------------------------------
// Component trait
// ---------------------------------------------------------------------------

/// A type that can be stored as a component.
///
/// `MODULE` and `NAME` form the stable identity hashed into the
/// [`ComponentTypeId`]. They must not change between builds that need to
/// agree on ids. Use the [`component!`](crate::component!) macro to implement
/// this trait.
pub trait Component: bytemuck::Pod + Send + Sync + 'static {
    /// The defining module (for example `"sim::motion"`).
    const MODULE: &'static str;
    /// The type name within the module.
    const NAME: &'static str;
}

/// Implement [`Component`] for a `Pod` type.
///
/// With just a type name the module is `module_path!()` and the name is the
/// identifier. An explicit module/name pair pins the identity independently of
/// where the type lives in the source tree.
///
/// ```
/// use tessera_ecs::component;
///
/// #[derive(Clone, Copy, bytemuck_derive::Zeroable, bytemuck_derive::Pod)]
/// #[repr(C)]
/// struct Mass(f32);
/// component!(Mass, "physics", "Mass");
/// ```
#[macro_export]
macro_rules! component {
    ($ty:ident) => {
        impl $crate::component::Component for $ty {
            const MODULE: &'static str = module_path!();
            const NAME: &'static str = stringify!($ty);
        }
    };
    ($ty:ty, $module:expr, $name:expr) => {
        impl $crate::component::Component for $ty {
            const MODULE: &'static str = $module;
            const NAME: &'static str = $name;
        }
    };
}

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Stable, non-zero identifier for a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentTypeId(pub(crate) u32);

impl ComponentTypeId {
    /// The raw id value. Never zero for a registered type.
    #[inline]
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({:#010x})", self.0)
    }
}

impl fmt::Display for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentHandle
// ---------------------------------------------------------------------------

/// Typed proof that `T` was registered, carrying its [`ComponentTypeId`].
///
/// Handles are what processors use to request column views.
pub struct ComponentHandle<T> {
    id: ComponentTypeId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ComponentHandle<T> {
    pub(crate) fn new(id: ComponentTypeId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// The component type id.
    #[inline]
    pub fn id(&self) -> ComponentTypeId {
        self.id
    }
}

impl<T> Clone for ComponentHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ComponentHandle<T> {}

impl<T> PartialEq for ComponentHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for ComponentHandle<T> {}

impl<T> fmt::Debug for ComponentHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentHandle<{}>({})", std::any::type_name::<T>(), self.id)
    }
}

impl<T> From<ComponentHandle<T>> for ComponentTypeId {
    fn from(handle: ComponentHandle<T>) -> Self {
        handle.id
    }
}

// ---------------------------------------------------------------------------
// Stable hashing
// ---------------------------------------------------------------------------

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[inline]
fn fnv1a_u16(mut hash: u64, unit: u16) -> u64 {
    // One FNV-1a round per byte of the little-endian code unit.
    for byte in unit.to_le_bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// 64-bit FNV-1a over the UTF-16 code units of `module`, a `'|'` separator,
/// then `name`.
///
/// Hashing UTF-16 units (as little-endian byte pairs) keeps the value
/// identical on every platform and for every host string representation.
pub fn stable_type_hash(module: &str, name: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for unit in module.encode_utf16() {
        hash = fnv1a_u16(hash, unit);
    }
    hash = fnv1a_u16(hash, u16::from(b'|'));
    for unit in name.encode_utf16() {
        hash = fnv1a_u16(hash, unit);
    }
    hash
}

/// Fold a 64-bit type hash to the 32-bit id space. Zero is reserved and maps
/// to one.
pub fn fold_type_hash(hash: u64) -> ComponentTypeId {
    let folded = (hash ^ (hash >> 32)) as u32;
    ComponentTypeId(if folded == 0 { 1 } else { folded })
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Static descriptor of a registered component type.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// Assigned id (the folded hash, or a probed id in permissive mode).
    pub id: ComponentTypeId,
    /// `Component::MODULE`.
    pub module: &'static str,
    /// `Component::NAME`.
    pub name: &'static str,
    /// Full 64-bit stable hash, the input to the manifest.
    pub stable_hash: u64,
    /// `std::mem::size_of::<T>()`
    pub size: usize,
    /// `std::mem::align_of::<T>()`
    pub align: usize,
    /// Rust `TypeId` for runtime type checking of typed column access.
    pub type_id: TypeId,
}

impl ComponentInfo {
    /// `module::name`, used in log and error messages.
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.module, self.name)
    }
}

// ---------------------------------------------------------------------------
// CollisionPolicy
// ---------------------------------------------------------------------------

/// What the registry does when two distinct types fold to the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Refuse the registration. Required whenever ids must match across
    /// independently started processes.
    #[default]
    Strict,
    /// Linear-probe to the next free id. Ids then depend on registration
    /// order and are only meaningful inside this process.
    Probe,
}

// ---------------------------------------------------------------------------
// ComponentManifest
// ---------------------------------------------------------------------------

/// Order-independent checksum over all registered type hashes.
///
/// Two registries that registered the same set of types (in any order) have
/// equal manifests. The 20-byte little-endian encoding from
/// [`to_bytes`](Self::to_bytes) is the handshake wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ComponentManifest {
    /// Number of registered types.
    pub count: u32,
    /// XOR of every stable hash.
    pub xor64: u64,
    /// Wrapping sum of every stable hash.
    pub sum64: u64,
}

impl ComponentManifest {
    /// Size of the wire encoding in bytes.
    pub const ENCODED_LEN: usize = 20;

    fn include(&mut self, stable_hash: u64) {
        self.count += 1;
        self.xor64 ^= stable_hash;
        self.sum64 = self.sum64.wrapping_add(stable_hash);
    }

    /// Encode as `count (u32) | xor64 (u64) | sum64 (u64)`, little-endian.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..4].copy_from_slice(&self.count.to_le_bytes());
        out[4..12].copy_from_slice(&self.xor64.to_le_bytes());
        out[12..20].copy_from_slice(&self.sum64.to_le_bytes());
        out
    }

    /// Decode the wire form produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EcsError> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(EcsError::ManifestDecode { len: bytes.len() });
        }
        let mut count = [0u8; 4];
        let mut xor64 = [0u8; 8];
        let mut sum64 = [0u8; 8];
        count.copy_from_slice(&bytes[0..4]);
        xor64.copy_from_slice(&bytes[4..12]);
        sum64.copy_from_slice(&bytes[12..20]);
        Ok(Self {
            count: u32::from_le_bytes(count),
            xor64: u64::from_le_bytes(xor64),
            sum64: u64::from_le_bytes(sum64),
        })
    }
}

// ---------------------------------------------------------------------------
// ComponentValue
// ---------------------------------------------------------------------------

/// A type-erased component value: the Rust type plus its byte image.
///
/// Resolved to a [`ComponentTypeId`] against the target world's registry at
/// the point of use, so values can be built without access to a registry.
#[derive(Clone, PartialEq, Eq)]
pub struct ComponentValue {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) bytes: Vec<u8>,
}

impl ComponentValue {
    /// Capture `value` by copying its bytes.
    pub fn new<T: Component>(value: T) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: T::NAME,
            bytes: bytemuck::bytes_of(&value).to_vec(),
        }
    }

    /// Rust type of the captured value.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// `Component::NAME` of the captured value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The raw byte image.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for ComponentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentValue")
            .field("type_name", &self.type_name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types to stable [`ComponentTypeId`]s and metadata.
///
/// Registration is idempotent per Rust type. The registry belongs to exactly
/// one world; there is no process-wide registry.
#[derive(Debug)]
pub struct ComponentRegistry {
    policy: CollisionPolicy,
    /// TypeId -> ComponentTypeId for dedup.
    by_type: HashMap<TypeId, ComponentTypeId>,
    /// Ordered by id so iteration is deterministic.
    infos: BTreeMap<ComponentTypeId, ComponentInfo>,
    manifest: ComponentManifest,
}

impl ComponentRegistry {
    /// Create an empty registry with the given collision policy.
    pub fn new(policy: CollisionPolicy) -> Self {
        Self {
            policy,
            by_type: HashMap::new(),
            infos: BTreeMap::new(),
            manifest: ComponentManifest::default(),
        }
    }

    /// Register `T`, returning its typed handle.
    ///
    /// Repeated calls for the same type return the same handle. In
    /// [`CollisionPolicy::Strict`] mode a hash collision with a different,
    /// already-registered type is an error naming both types.
    pub fn register<T: Component>(&mut self) -> Result<ComponentHandle<T>, EcsError> {
        let rust_type_id = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type_id) {
            return Ok(ComponentHandle::new(existing));
        }

        let stable_hash = stable_type_hash(T::MODULE, T::NAME);
        let natural = fold_type_hash(stable_hash);
        let id = match (self.infos.get(&natural), self.policy) {
            (None, _) => natural,
            (Some(existing), CollisionPolicy::Strict) => {
                return Err(EcsError::TypeIdCollision {
                    id: natural,
                    existing: existing.qualified_name(),
                    incoming: format!("{}::{}", T::MODULE, T::NAME),
                });
            }
            (Some(existing), CollisionPolicy::Probe) => {
                let probed = self.probe_free_id(natural);
                warn!(
                    component = %format_args!("{}::{}", T::MODULE, T::NAME),
                    colliding_with = %existing.qualified_name(),
                    natural_id = %natural,
                    assigned_id = %probed,
                    "component type id collision resolved by probing; id is process-local"
                );
                probed
            }
        };

        let info = ComponentInfo {
            id,
            module: T::MODULE,
            name: T::NAME,
            stable_hash,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            type_id: rust_type_id,
        };
        debug!(component = %info.qualified_name(), id = %id, "registered component type");
        self.infos.insert(id, info);
        self.by_type.insert(rust_type_id, id);
        self.manifest.include(stable_hash);
        Ok(ComponentHandle::new(id))
    }

    fn probe_free_id(&self, start: ComponentTypeId) -> ComponentTypeId {
        let mut candidate = start.0;
        loop {
            candidate = candidate.wrapping_add(1);
            if candidate == 0 {
                continue;
            }
            if !self.infos.contains_key(&ComponentTypeId(candidate)) {
                return ComponentTypeId(candidate);
            }
        }
    }

    /// Handle for an already-registered `T`.
    pub fn lookup<T: Component>(&self) -> Option<ComponentHandle<T>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .map(|&id| ComponentHandle::new(id))
    }

    /// Id for a Rust `TypeId`, if registered.
    pub fn lookup_type_id(&self, type_id: TypeId) -> Option<ComponentTypeId> {
        self.by_type.get(&type_id).copied()
    }

    /// Metadata for a registered id.
    pub fn get_info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.infos.get(&id)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: ComponentTypeId) -> bool {
        self.infos.contains_key(&id)
    }

    /// All registered types in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.infos.values()
    }

    /// Total number of registered component types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any component types have been registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// The configured collision policy.
    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    /// Checksum over everything registered so far.
    pub fn manifest(&self) -> ComponentManifest {
        self.manifest
    }

    /// Qualified names of all registered types, sorted, for error messages.
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.infos.values().map(|i| i.qualified_name()).collect();
        names.sort();
        names
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new(CollisionPolicy::Strict)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
