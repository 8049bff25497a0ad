//! Staging records and the field schema used for dirty checking.
//!
//! A [`Tranlocal`] is either a frozen committed record (`write_version > 0`,
//! shared through an `Arc`) or a draft owned by one transaction
//! (`write_version == 0`, with `origin` pointing at the record it was cloned from).
//!
//! Dirtiness is decided field by field through [`Tracked::unchanged_from`]:
//! plain values compare with `==`, shared references (`Arc`) compare by identity.
//! Publishing a new `Arc` with equal contents is still a write.

use std::sync::Arc;

/// Value stored in a transactional object.
///
/// `unchanged_from` answers whether publishing `self` in place of `origin`
/// would change nothing. Implement it with [`tracked_fields!`] for structs.
pub trait Tracked: Clone + Send + Sync + 'static {
    fn unchanged_from(&self, origin: &Self) -> bool;
}

macro_rules! tracked_by_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Tracked for $ty {
                #[inline]
                fn unchanged_from(&self, origin: &Self) -> bool {
                    self == origin
                }
            }
        )*
    };
}

tracked_by_value!(
    (),
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    String,
    &'static str,
    std::time::Duration,
);

impl Tracked for f32 {
    #[inline]
    fn unchanged_from(&self, origin: &Self) -> bool {
        self.to_bits() == origin.to_bits()
    }
}

impl Tracked for f64 {
    #[inline]
    fn unchanged_from(&self, origin: &Self) -> bool {
        self.to_bits() == origin.to_bits()
    }
}

impl<T: ?Sized + Send + Sync + 'static> Tracked for Arc<T> {
    #[inline]
    fn unchanged_from(&self, origin: &Self) -> bool {
        Arc::ptr_eq(self, origin)
    }
}

impl<T: Tracked> Tracked for Option<T> {
    fn unchanged_from(&self, origin: &Self) -> bool {
        match (self, origin) {
            (Some(a), Some(b)) => a.unchanged_from(b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl<T: Tracked> Tracked for Vec<T> {
    fn unchanged_from(&self, origin: &Self) -> bool {
        self.len() == origin.len()
            && self
                .iter()
                .zip(origin.iter())
                .all(|(a, b)| a.unchanged_from(b))
    }
}

impl<A: Tracked, B: Tracked> Tracked for (A, B) {
    fn unchanged_from(&self, origin: &Self) -> bool {
        self.0.unchanged_from(&origin.0) && self.1.unchanged_from(&origin.1)
    }
}

impl<A: Tracked, B: Tracked, C: Tracked> Tracked for (A, B, C) {
    fn unchanged_from(&self, origin: &Self) -> bool {
        self.0.unchanged_from(&origin.0)
            && self.1.unchanged_from(&origin.1)
            && self.2.unchanged_from(&origin.2)
    }
}

/// Implement [`Tracked`] for a struct by comparing the listed fields.
///
/// ```
/// use std::sync::Arc;
/// use vstm::{tracked_fields, Tracked};
///
/// #[derive(Clone)]
/// struct Account {
///     balance: i64,
///     owner: Arc<String>,
/// }
///
/// tracked_fields!(Account { balance, owner });
///
/// let owner = Arc::new("ann".to_string());
/// let a = Account { balance: 1, owner: owner.clone() };
/// let b = Account { balance: 1, owner };
/// assert!(a.unchanged_from(&b));
/// ```
#[macro_export]
macro_rules! tracked_fields {
    ($ty:ty { $($field:ident),+ $(,)? }) => {
        impl $crate::Tracked for $ty {
            fn unchanged_from(&self, origin: &Self) -> bool {
                true $(&& $crate::Tracked::unchanged_from(&self.$field, &origin.$field))+
            }
        }
    };
}

/// Staging record for one object inside one transaction, or a published record.
#[derive(Debug)]
pub struct Tranlocal<T> {
    origin: Option<Arc<Tranlocal<T>>>,
    write_version: u64,
    value: T,
}

impl<T: Tracked> Tranlocal<T> {
    /// Draft for a brand new object.
    pub fn constructing(value: T) -> Self {
        Self {
            origin: None,
            write_version: 0,
            value,
        }
    }

    /// Frozen record as it is stored in a transactional object.
    pub(crate) fn published(value: T, version: u64) -> Self {
        debug_assert!(version > 0);
        Self {
            origin: None,
            write_version: version,
            value,
        }
    }

    /// New mutable draft derived from a frozen record.
    pub fn clone_for_update(self: &Arc<Self>) -> Self {
        Self {
            origin: Some(Arc::clone(self)),
            write_version: 0,
            value: self.value.clone(),
        }
    }

    /// A record is dirty when it is uncommitted and would publish something new.
    pub fn is_dirty(&self) -> bool {
        if self.write_version > 0 {
            return false;
        }
        match &self.origin {
            None => true,
            Some(origin) => !self.value.unchanged_from(&origin.value),
        }
    }

    /// Freeze this draft as the record committed at `version`.
    pub(crate) fn freeze(mut self, version: u64) -> Self {
        debug_assert_eq!(self.write_version, 0, "record is already frozen");
        self.write_version = version;
        self.origin = None;
        self
    }

    /// Copy of the mutable fields, for nested rollback.
    pub fn take_snapshot(&self) -> T {
        self.value.clone()
    }

    /// Restore fields captured with [`Tranlocal::take_snapshot`].
    pub fn restore(&mut self, snapshot: T) {
        debug_assert!(!self.is_frozen());
        self.value = snapshot;
    }
}

impl<T> Tranlocal<T> {
    #[inline]
    pub fn value(&self) -> &T {
        &self.value
    }

    #[inline]
    pub fn value_mut(&mut self) -> &mut T {
        debug_assert_eq!(self.write_version, 0, "frozen records are immutable");
        &mut self.value
    }

    #[inline]
    pub fn write_version(&self) -> u64 {
        self.write_version
    }

    #[inline]
    pub fn is_frozen(&self) -> bool {
        self.write_version > 0
    }

    #[inline]
    pub fn origin(&self) -> Option<&Arc<Tranlocal<T>>> {
        self.origin.as_ref()
    }
}
