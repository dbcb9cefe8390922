//! Capability tokens: proof of which resource locks a call chain holds.
//!
//! A [`Token`] is created empty at a request boundary and widened by every
//! successful acquisition. It is checked twice:
//!
//! - at compile time, through its level marker `L`: the typed acquisition
//!   path only accepts a resource `R` when `R: Above<L>`
//! - at run time, through [`Token::check`], which compares orders against the
//!   held set and is never skipped
//!
//! The run-time check is the system of record. [`Token::erase`] exists for
//! code that cannot track the level statically (for example, acquisition
//! sequences only known at run time). An erased token satisfies every static
//! bound, so without the run-time check it would silently defeat ordering.

use crate::error::LockError;
use crate::mutex::Grant;
use shared::{LockMode, Resource};
use std::fmt;
use std::marker::PhantomData;

/// Type-level marker describing the highest resource a token holds.
pub trait Level: 'static {
    /// The statically known maximum, or `None` for [`level::Root`].
    const MAX: Option<Resource>;
    /// True only for [`level::Any`], whose maximum is not known statically.
    const ERASED: bool = false;
}

/// A level marker that names a single resource.
pub trait ResourceLevel: Level {
    const RESOURCE: Resource;
}

/// `R: Above<L>` holds when `R` may be acquired by a chain at level `L`.
pub trait Above<L: Level>: ResourceLevel {}

pub mod level {
    use super::{Above, Level, ResourceLevel};
    use shared::Resource;

    /// Nothing held yet.
    #[derive(Debug)]
    pub enum Root {}

    /// Erased level. Every resource is statically acquirable from it; only
    /// the run-time check guards it.
    #[derive(Debug)]
    pub enum Any {}

    impl Level for Root {
        const MAX: Option<Resource> = None;
    }

    impl Level for Any {
        const MAX: Option<Resource> = None;
        const ERASED: bool = true;
    }

    macro_rules! resource_levels {
        ($($marker:ident => $resource:ident),+ $(,)?) => {
            $(
                #[derive(Debug)]
                pub enum $marker {}

                impl Level for $marker {
                    const MAX: Option<Resource> = Some(Resource::$resource);
                }

                impl ResourceLevel for $marker {
                    const RESOURCE: Resource = Resource::$resource;
                }

                impl Above<Root> for $marker {}
                impl Above<Any> for $marker {}
            )+
        };
    }

    macro_rules! above {
        ($marker:ident: $($lower:ident),+) => {
            $(impl Above<$lower> for $marker {})+
        };
    }

    resource_levels! {
        World => World,
        Users => Users,
        Store => Store,
        Messages => Messages,
    }

    above!(Users: World);
    above!(Store: World, Users);
    above!(Messages: World, Users, Store);
}

/// The locks a call chain holds, with a compile-time level marker `L`.
///
/// Tokens cannot be constructed with a non-empty held set outside this
/// crate: the only way to widen one is a real acquisition through the lock
/// table. Each held resource records the engine grant, so a token that
/// outlives its scope is recognised as stale by held accessors.
///
/// A token belongs to the call chain that acquired its locks and cannot be
/// duplicated. It is `Send` so that chain may resume on any worker thread.
///
/// ```compile_fail
/// use server::token::Token;
///
/// let root = Token::empty();
/// let _twin = root.clone();
/// ```
pub struct Token<L: Level = level::Root> {
    grants: [Option<Grant>; Resource::COUNT],
    _level: PhantomData<fn() -> L>,
}

impl Token<level::Root> {
    /// A token holding nothing. Entry point for every request.
    pub fn empty() -> Self {
        Token {
            grants: [None; Resource::COUNT],
            _level: PhantomData,
        }
    }
}

impl<L: Level> Token<L> {
    /// Whether this chain holds `resource`.
    pub fn holds(&self, resource: Resource) -> bool {
        self.grants[resource.index()].is_some()
    }

    /// The mode `resource` is held in, if it is held.
    pub fn mode_of(&self, resource: Resource) -> Option<LockMode> {
        self.grant_for(resource).map(|grant| grant.mode())
    }

    /// The highest-order resource held. Derived from the held set, so it can
    /// never disagree with it.
    pub fn max_resource(&self) -> Option<Resource> {
        Resource::ALL
            .iter()
            .rev()
            .copied()
            .find(|resource| self.holds(*resource))
    }

    /// Order of the highest held resource, or `None` when nothing is held.
    pub fn max_order(&self) -> Option<u8> {
        self.max_resource().map(Resource::order)
    }

    pub fn held(&self) -> impl Iterator<Item = Resource> + '_ {
        Resource::ALL
            .iter()
            .copied()
            .filter(move |resource| self.holds(*resource))
    }

    pub fn is_empty(&self) -> bool {
        self.max_resource().is_none()
    }

    /// The ordering predicate: `resource` may be acquired only if its order
    /// is strictly greater than the held maximum. Re-acquiring a held
    /// resource fails the same way.
    pub fn check(&self, resource: Resource) -> Result<(), LockError> {
        match self.max_resource() {
            Some(held_max) if resource.order() <= held_max.order() => {
                Err(LockError::OrderViolation {
                    requested: resource,
                    held_max,
                })
            }
            _ => Ok(()),
        }
    }

    /// Drops the static level, keeping the held set.
    pub fn erase(&self) -> Token<level::Any> {
        Token {
            grants: self.grants,
            _level: PhantomData,
        }
    }

    pub(crate) fn grant_for(&self, resource: Resource) -> Option<Grant> {
        self.grants[resource.index()]
    }

    /// Checks the order and produces the widened token for `grant`.
    pub(crate) fn acquire<R: Level>(
        &self,
        resource: Resource,
        grant: Grant,
    ) -> Result<Token<R>, LockError> {
        self.check(resource)?;
        let mut grants = self.grants;
        grants[resource.index()] = Some(grant);
        let widened = Token {
            grants,
            _level: PhantomData,
        };
        debug_assert!(R::ERASED || R::MAX == widened.max_resource());
        Ok(widened)
    }
}

impl Default for Token<level::Root> {
    fn default() -> Self {
        Token::empty()
    }
}

impl<L: Level> fmt::Debug for Token<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.held()
                    .map(|resource| (resource, self.mode_of(resource))),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex::ResourceMutex;
    use proptest::prelude::*;
    use tokio_test::block_on;

    /// Real grants from throwaway locks; the token only records them.
    fn grant(resource: Resource) -> Grant {
        let mutex = ResourceMutex::new(resource);
        let guard = block_on(mutex.acquire(LockMode::Exclusive)).unwrap();
        guard.grant()
    }

    fn level_of<R: Above<L>, L: Level>() -> (Resource, Option<Resource>) {
        (R::RESOURCE, L::MAX)
    }

    #[test]
    fn test_tokens_move_between_threads() {
        fn assert_send<T: Send>() {}
        assert_send::<Token>();
        assert_send::<Token<level::Messages>>();
        assert_send::<Token<level::Any>>();
    }

    #[test]
    fn test_empty_token_holds_nothing() {
        let token = Token::empty();
        assert!(token.is_empty());
        assert_eq!(token.max_order(), None);
        for resource in Resource::ALL {
            assert!(!token.holds(resource));
            assert!(token.check(resource).is_ok());
        }
    }

    #[test]
    fn test_acquire_widens_in_order() {
        let root = Token::empty();
        let world: Token<level::World> = root
            .acquire(Resource::World, grant(Resource::World))
            .unwrap();
        let users: Token<level::Users> = world
            .acquire(Resource::Users, grant(Resource::Users))
            .unwrap();
        let store: Token<level::Store> = users
            .acquire(Resource::Store, grant(Resource::Store))
            .unwrap();

        assert_eq!(store.max_order(), Some(3));
        assert_eq!(store.max_resource(), Some(Resource::Store));
        assert_eq!(
            store.held().collect::<Vec<_>>(),
            vec![Resource::World, Resource::Users, Resource::Store]
        );
        // Widening leaves the narrower token as it was.
        assert!(root.is_empty());
        assert!(!world.holds(Resource::Users));
    }

    #[test]
    fn test_lower_order_is_rejected() {
        let users: Token<level::Users> = Token::empty()
            .acquire(Resource::Users, grant(Resource::Users))
            .unwrap();

        let err = users.check(Resource::World).unwrap_err();
        assert_eq!(
            err,
            LockError::OrderViolation {
                requested: Resource::World,
                held_max: Resource::Users,
            }
        );
    }

    #[test]
    fn test_reacquiring_held_resource_is_rejected() {
        let world: Token<level::World> = Token::empty()
            .acquire(Resource::World, grant(Resource::World))
            .unwrap();

        let err = world
            .acquire::<level::Any>(Resource::World, grant(Resource::World))
            .unwrap_err();
        assert_eq!(
            err,
            LockError::OrderViolation {
                requested: Resource::World,
                held_max: Resource::World,
            }
        );
    }

    #[test]
    fn test_erased_token_keeps_runtime_check() {
        let users: Token<level::Users> = Token::empty()
            .acquire(Resource::Users, grant(Resource::Users))
            .unwrap();
        let erased = users.erase();

        assert!(erased.holds(Resource::Users));
        assert!(erased.check(Resource::World).unwrap_err().is_order_violation());
        assert!(erased.check(Resource::Messages).is_ok());
    }

    #[test]
    fn test_mode_is_recorded() {
        let mutex = ResourceMutex::new(Resource::World);
        let guard = block_on(mutex.acquire(LockMode::Shared)).unwrap();
        let world: Token<level::World> = Token::empty()
            .acquire(Resource::World, guard.grant())
            .unwrap();
        assert_eq!(world.mode_of(Resource::World), Some(LockMode::Shared));
        assert_eq!(world.mode_of(Resource::Users), None);
    }

    #[test]
    fn test_static_levels_agree_with_orders() {
        let pairs = [
            level_of::<level::World, level::Root>(),
            level_of::<level::Users, level::World>(),
            level_of::<level::Store, level::World>(),
            level_of::<level::Store, level::Users>(),
            level_of::<level::Messages, level::World>(),
            level_of::<level::Messages, level::Users>(),
            level_of::<level::Messages, level::Store>(),
        ];
        for (resource, lower) in pairs {
            if let Some(lower) = lower {
                assert!(resource.order() > lower.order());
            }
        }
    }

    fn arb_resource() -> impl Strategy<Value = Resource> {
        prop::sample::select(Resource::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_acquire_succeeds_iff_order_is_greater(
            sequence in prop::collection::vec(arb_resource(), 0..12)
        ) {
            let mut token = Token::empty().erase();
            for resource in sequence {
                let expected_ok = token
                    .max_order()
                    .map_or(true, |max| resource.order() > max);
                match token.acquire::<level::Any>(resource, grant(resource)) {
                    Ok(widened) => {
                        prop_assert!(expected_ok);
                        prop_assert_eq!(widened.max_order(), Some(resource.order()));
                        prop_assert!(widened.holds(resource));
                        token = widened;
                    }
                    Err(err) => {
                        prop_assert!(!expected_ok);
                        prop_assert!(err.is_order_violation());
                    }
                }
            }
        }

        #[test]
        fn prop_held_resources_can_never_be_reacquired(
            sequence in prop::collection::vec(arb_resource(), 1..8)
        ) {
            let mut token = Token::empty().erase();
            for resource in sequence {
                if let Ok(widened) = token.acquire::<level::Any>(resource, grant(resource)) {
                    token = widened;
                }
            }
            for held in token.held().collect::<Vec<_>>() {
                prop_assert!(token.check(held).unwrap_err().is_order_violation());
            }
        }
    }
}
