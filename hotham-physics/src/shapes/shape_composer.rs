use log::debug;

use super::GeometryShape;
use crate::{
    backend::{AggregateKind, BodyHandle, PhysicsBackend, ShapeHandle, ShapeKind},
    HothamError, HothamResult,
};

/// What kind of shape a [`ShapeComposer`] is currently binding to its body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    /// No colliders: an empty placeholder shape
    Null,
    /// Exactly one collider, bound directly
    Single,
    /// Two or more colliders in a Compound aggregate
    Compound,
    /// A static body's Scene aggregate, whatever the number of colliders
    Scene,
    /// The composer has been destroyed
    Detached,
}

enum Root {
    Null(GeometryShape),
    /// The only member is the root
    Member,
    Aggregate(GeometryShape),
    Detached,
}

/// Reduces the collision shapes of one rigid body to the single root shape the engine binds to it.
///
/// - no colliders: a Null placeholder
/// - one collider: that collider's shape
/// - two or more: a Compound aggregate holding all of them
/// - scene (static) bodies: always a Scene aggregate, even when empty
///
/// Every operation leaves the body bound to a valid root before returning. When `body` is `Some`,
/// root changes are rebound to it immediately.
pub struct ShapeComposer {
    scene: bool,
    members: Vec<GeometryShape>,
    root: Root,
}

impl std::fmt::Debug for ShapeComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShapeComposer")
            .field("root", &self.root_kind())
            .field("members", &self.members)
            .finish()
    }
}

/// Run `edit` inside an update bracket on `aggregate`. The bracket is always closed.
fn bracketed(
    backend: &mut dyn PhysicsBackend,
    aggregate: ShapeHandle,
    edit: impl FnOnce(&mut dyn PhysicsBackend) -> HothamResult<()>,
) -> HothamResult<()> {
    backend.begin_update(aggregate)?;
    let result = edit(&mut *backend);
    let end = backend.end_update(aggregate);
    result.and(end)
}

fn insert_members(
    backend: &mut dyn PhysicsBackend,
    aggregate: ShapeHandle,
    members: &mut [GeometryShape],
) -> HothamResult<()> {
    bracketed(backend, aggregate, |backend| {
        for member in members.iter_mut() {
            let slot = backend.add_member(aggregate, member.handle())?;
            member.set_slot(Some(slot));
        }
        Ok(())
    })
}

/// Build an aggregate and fill it. On failure the aggregate is destroyed and the members left detached.
fn build_aggregate(
    backend: &mut dyn PhysicsBackend,
    kind: AggregateKind,
    members: &mut [GeometryShape],
) -> HothamResult<GeometryShape> {
    let aggregate = GeometryShape::aggregate(backend, kind)?;
    match insert_members(backend, aggregate.handle(), members) {
        Ok(()) => Ok(aggregate),
        Err(e) => {
            aggregate.destroy(backend);
            members.iter_mut().for_each(|m| m.set_slot(None));
            Err(e)
        }
    }
}

fn bind(
    backend: &mut dyn PhysicsBackend,
    body: Option<BodyHandle>,
    root: ShapeHandle,
) -> HothamResult<()> {
    match body {
        Some(body) => backend.set_body_shape(body, root),
        None => Ok(()),
    }
}

impl ShapeComposer {
    /// Compose the initial root from the shapes discovered under a body.
    ///
    /// Takes ownership of `shapes`. If composition fails they are all destroyed.
    pub fn build(
        backend: &mut dyn PhysicsBackend,
        scene: bool,
        mut shapes: Vec<GeometryShape>,
    ) -> HothamResult<Self> {
        let checked = shapes
            .iter()
            .enumerate()
            .try_for_each(|(i, shape)| {
                if shapes[..i].iter().any(|s| s.handle() == shape.handle()) {
                    return Err(HothamError::structural("the same shape was given twice"));
                }
                check_primitive(&*backend, shape)
            });

        let root = checked.and_then(|_| {
            if scene {
                return build_aggregate(backend, AggregateKind::Scene, &mut shapes)
                    .map(Root::Aggregate);
            }
            match shapes.len() {
                0 => GeometryShape::null(backend).map(Root::Null),
                1 => Ok(Root::Member),
                _ => build_aggregate(backend, AggregateKind::Compound, &mut shapes)
                    .map(Root::Aggregate),
            }
        });

        match root {
            Ok(root) => Ok(Self {
                scene,
                members: shapes,
                root,
            }),
            Err(e) => {
                for shape in shapes {
                    shape.destroy(backend);
                }
                Err(e)
            }
        }
    }

    /// The classification of the current root
    pub fn root_kind(&self) -> RootKind {
        match &self.root {
            Root::Null(_) => RootKind::Null,
            Root::Member => RootKind::Single,
            Root::Aggregate(aggregate) if aggregate.kind() == ShapeKind::Scene => RootKind::Scene,
            Root::Aggregate(_) => RootKind::Compound,
            Root::Detached => RootKind::Detached,
        }
    }

    /// The shape the engine should bind to the body. `None` once destroyed.
    pub fn root(&self) -> Option<ShapeHandle> {
        match &self.root {
            Root::Null(shape) | Root::Aggregate(shape) => Some(shape.handle()),
            Root::Member => self.members.first().map(GeometryShape::handle),
            Root::Detached => None,
        }
    }

    /// Was this composer built for a scene (static) body?
    pub fn is_scene(&self) -> bool {
        self.scene
    }

    /// Number of collider shapes, not counting placeholders or aggregates
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// No collider shapes at all?
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The collider shapes
    pub fn members(&self) -> impl Iterator<Item = &GeometryShape> {
        self.members.iter()
    }

    /// Is `shape` one of the collider shapes?
    pub fn contains(&self, shape: ShapeHandle) -> bool {
        self.members.iter().any(|m| m.handle() == shape)
    }

    /// Add a collider shape at run time.
    ///
    /// Takes ownership of `shape`. If it is rejected it is destroyed and the composer is left as it was.
    pub fn add_collider(
        &mut self,
        backend: &mut dyn PhysicsBackend,
        body: Option<BodyHandle>,
        mut shape: GeometryShape,
    ) -> HothamResult<ShapeHandle> {
        let handle = shape.handle();
        if let Err(e) = self.check_addable(backend, &shape) {
            shape.destroy(backend);
            return Err(e);
        }

        let result = match &self.root {
            Root::Detached => Err(HothamError::structural("shape composer has been destroyed")),
            Root::Aggregate(aggregate) => {
                insert_members(backend, aggregate.handle(), std::slice::from_mut(&mut shape))
            }
            Root::Null(_) => bind(backend, body, handle).map(|_| {
                debug!("[HOTHAM_PHYSICS] Null root replaced by {:?}", shape.kind());
                if let Root::Null(null) = std::mem::replace(&mut self.root, Root::Member) {
                    null.destroy(backend);
                }
            }),
            Root::Member => self.demote(backend, body, &mut shape),
        };

        match result {
            Ok(()) => {
                self.members.push(shape);
                Ok(handle)
            }
            Err(e) => {
                shape.destroy(backend);
                Err(e)
            }
        }
    }

    /// Move the single root and `shape` into a new Compound, and bind that instead.
    fn demote(
        &mut self,
        backend: &mut dyn PhysicsBackend,
        body: Option<BodyHandle>,
        shape: &mut GeometryShape,
    ) -> HothamResult<()> {
        let compound = GeometryShape::aggregate(backend, AggregateKind::Compound)?;
        let result = insert_members(backend, compound.handle(), &mut self.members)
            .and_then(|_| {
                insert_members(backend, compound.handle(), std::slice::from_mut(&mut *shape))
            })
            .and_then(|_| bind(backend, body, compound.handle()));

        match result {
            Ok(()) => {
                debug!("[HOTHAM_PHYSICS] Single root demoted into a Compound");
                self.root = Root::Aggregate(compound);
                Ok(())
            }
            Err(e) => {
                compound.destroy(backend);
                self.members.iter_mut().for_each(|m| m.set_slot(None));
                shape.set_slot(None);
                Err(e)
            }
        }
    }

    /// Remove a collider shape at run time and destroy it.
    ///
    /// The root itself can't be removed while it is a Null placeholder or an aggregate:
    /// aggregates are emptied by removing their members.
    pub fn remove_collider(
        &mut self,
        backend: &mut dyn PhysicsBackend,
        body: Option<BodyHandle>,
        shape: ShapeHandle,
    ) -> HothamResult<()> {
        match &self.root {
            Root::Detached => {
                return Err(HothamError::structural("shape composer has been destroyed"))
            }
            Root::Null(root) | Root::Aggregate(root) if root.handle() == shape => {
                return Err(HothamError::structural(format!(
                    "can't remove the {:?} root shape",
                    root.kind()
                )))
            }
            _ => {}
        }
        let index = self
            .members
            .iter()
            .position(|m| m.handle() == shape)
            .ok_or_else(|| HothamError::structural("shape is not a member of this body"))?;

        match &self.root {
            Root::Aggregate(aggregate) if self.scene || self.members.len() > 2 => {
                let aggregate = aggregate.handle();
                if let Some(slot) = self.members[index].slot() {
                    bracketed(backend, aggregate, |backend| backend.remove_member(aggregate, slot))?;
                }
            }
            Root::Aggregate(aggregate) => {
                // Down to one member: drop the Compound and bind the survivor directly.
                let aggregate = aggregate.handle();
                let slots: Vec<_> = self.members.iter().filter_map(GeometryShape::slot).collect();
                bracketed(backend, aggregate, |backend| {
                    slots
                        .into_iter()
                        .try_for_each(|slot| backend.remove_member(aggregate, slot))
                })?;
                self.members.iter_mut().for_each(|m| m.set_slot(None));

                let survivor = self.members[1 - index].handle();
                bind(backend, body, survivor)?;
                if let Root::Aggregate(compound) = std::mem::replace(&mut self.root, Root::Member) {
                    compound.destroy(backend);
                }
                debug!("[HOTHAM_PHYSICS] Compound dissolved, single root remains");
            }
            Root::Member => {
                let null = GeometryShape::null(backend)?;
                if let Err(e) = bind(backend, body, null.handle()) {
                    null.destroy(backend);
                    return Err(e);
                }
                self.root = Root::Null(null);
                debug!("[HOTHAM_PHYSICS] Last collider removed, Null root bound");
            }
            Root::Null(_) | Root::Detached => {
                return Err(HothamError::structural("shape is not a member of this body"))
            }
        }

        self.members.remove(index).destroy(backend);
        Ok(())
    }

    /// Free every member shape, then the root. Safe to call more than once.
    pub fn destroy(&mut self, backend: &mut dyn PhysicsBackend) {
        for member in self.members.drain(..) {
            member.destroy(backend);
        }
        if let Root::Null(root) | Root::Aggregate(root) =
            std::mem::replace(&mut self.root, Root::Detached)
        {
            root.destroy(backend);
        }
    }

    /// Forget every shape without touching the engine. Used when the engine itself is gone.
    pub(crate) fn abandon(&mut self) {
        self.members.clear();
        self.root = Root::Detached;
    }

    fn check_addable(
        &self,
        backend: &dyn PhysicsBackend,
        shape: &GeometryShape,
    ) -> HothamResult<()> {
        if matches!(self.root, Root::Detached) {
            return Err(HothamError::structural("shape composer has been destroyed"));
        }
        if self.contains(shape.handle()) {
            return Err(HothamError::structural("shape is already a member of this body"));
        }
        check_primitive(backend, shape)
    }
}

fn check_primitive(backend: &dyn PhysicsBackend, shape: &GeometryShape) -> HothamResult<()> {
    match backend.shape_kind(shape.handle()) {
        None | Some(ShapeKind::Null) => Err(HothamError::invalid_shape(
            "shape has no usable collision primitive",
        )),
        Some(kind) if kind.is_aggregate() => Err(HothamError::structural(
            "an aggregate can't be added as a collider",
        )),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{BodyDescriptor, RapierBackend, ShapeDescriptor},
        components::{BodyType, Geometry},
    };
    use glam::{Quat, Vec3};

    fn sphere(backend: &mut RapierBackend) -> GeometryShape {
        shape(backend, Geometry::Sphere { radius: 0.5 })
    }

    fn cube(backend: &mut RapierBackend) -> GeometryShape {
        shape(backend, Geometry::Box { size: Vec3::ONE })
    }

    fn shape(backend: &mut RapierBackend, geometry: Geometry) -> GeometryShape {
        GeometryShape::new(
            backend,
            &ShapeDescriptor {
                geometry,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn bind_body(
        backend: &mut RapierBackend,
        composer: &ShapeComposer,
        body_type: BodyType,
    ) -> BodyHandle {
        backend
            .create_body(&BodyDescriptor {
                body_type,
                root: composer.root().unwrap(),
                position: Vec3::ZERO,
                rotation: Quat::IDENTITY,
                mass: Default::default(),
                linear_damping: 0.1,
                angular_damping: 0.1,
                linear_velocity: Vec3::ZERO,
                angular_velocity: Vec3::ZERO,
                enabled: true,
                user_data: 0,
            })
            .unwrap()
    }

    /// Root is Null iff empty, Single iff one member, Compound iff two or more.
    fn assert_classified(backend: &RapierBackend, composer: &ShapeComposer, body: BodyHandle) {
        let expected = match composer.len() {
            0 => RootKind::Null,
            1 => RootKind::Single,
            _ => RootKind::Compound,
        };
        assert_eq!(composer.root_kind(), expected);
        assert_eq!(backend.body_shape(body), composer.root());
        assert_eq!(backend.stats().colliders, composer.len());
        if expected == RootKind::Single {
            assert_eq!(composer.root(), composer.members().next().map(|m| m.handle()));
        }
        if expected == RootKind::Compound {
            assert_eq!(backend.member_count(composer.root().unwrap()), Some(composer.len()));
        }
    }

    #[test]
    pub fn test_add_and_remove_colliders() {
        let mut backend = RapierBackend::default();
        let mut composer = ShapeComposer::build(&mut backend, false, vec![]).unwrap();
        let body = bind_body(&mut backend, &composer, BodyType::Dynamic);
        assert_classified(&backend, &composer, body);

        let a = sphere(&mut backend);
        let a = composer.add_collider(&mut backend, Some(body), a).unwrap();
        assert_classified(&backend, &composer, body);

        let b = cube(&mut backend);
        let b = composer.add_collider(&mut backend, Some(body), b).unwrap();
        assert_classified(&backend, &composer, body);

        let c = sphere(&mut backend);
        let c = composer.add_collider(&mut backend, Some(body), c).unwrap();
        assert_classified(&backend, &composer, body);
        assert_eq!(composer.len(), 3);

        composer.remove_collider(&mut backend, Some(body), a).unwrap();
        assert_classified(&backend, &composer, body);
        assert_eq!(composer.root_kind(), RootKind::Compound);

        composer.remove_collider(&mut backend, Some(body), c).unwrap();
        assert_classified(&backend, &composer, body);
        assert_eq!(composer.root(), Some(b));

        // The compound is gone: only the box is left in the engine.
        assert_eq!(backend.stats().shapes, 1);

        composer.remove_collider(&mut backend, Some(body), b).unwrap();
        assert_classified(&backend, &composer, body);
        assert_eq!(backend.stats().shapes, 1);
        assert_eq!(
            backend.shape_kind(composer.root().unwrap()),
            Some(ShapeKind::Null)
        );
    }

    #[test]
    pub fn test_add_then_remove_restores_classification() {
        let mut backend = RapierBackend::default();
        let first = cube(&mut backend);
        let first_handle = first.handle();
        let mut composer = ShapeComposer::build(&mut backend, false, vec![first]).unwrap();
        let body = bind_body(&mut backend, &composer, BodyType::Dynamic);
        assert_eq!(composer.root_kind(), RootKind::Single);

        let extra = sphere(&mut backend);
        let extra = composer.add_collider(&mut backend, Some(body), extra).unwrap();
        assert_eq!(composer.root_kind(), RootKind::Compound);
        composer.remove_collider(&mut backend, Some(body), extra).unwrap();

        assert_eq!(composer.root_kind(), RootKind::Single);
        assert_eq!(composer.root(), Some(first_handle));
        assert_classified(&backend, &composer, body);
    }

    #[test]
    pub fn test_build_classifies() {
        let mut backend = RapierBackend::default();
        let shapes = vec![sphere(&mut backend), cube(&mut backend), sphere(&mut backend)];
        let composer = ShapeComposer::build(&mut backend, false, shapes).unwrap();
        assert_eq!(composer.root_kind(), RootKind::Compound);
        assert_eq!(backend.member_count(composer.root().unwrap()), Some(3));

        let single = vec![cube(&mut backend)];
        let composer = ShapeComposer::build(&mut backend, false, single).unwrap();
        assert_eq!(composer.root_kind(), RootKind::Single);
    }

    #[test]
    pub fn test_build_rejects_bad_shapes() {
        let mut backend = RapierBackend::default();
        let shapes = vec![sphere(&mut backend), GeometryShape::null(&mut backend).unwrap()];
        let result = ShapeComposer::build(&mut backend, false, shapes);
        assert!(matches!(result, Err(HothamError::InvalidShape { .. })));
        assert_eq!(backend.stats().shapes, 0);
    }

    #[test]
    pub fn test_scene_always_aggregates() {
        let mut backend = RapierBackend::default();
        let mut composer = ShapeComposer::build(&mut backend, true, vec![]).unwrap();
        let body = bind_body(&mut backend, &composer, BodyType::Static);
        assert_eq!(composer.root_kind(), RootKind::Scene);
        let scene = composer.root().unwrap();

        let a = cube(&mut backend);
        let a = composer.add_collider(&mut backend, Some(body), a).unwrap();
        assert_eq!(composer.root_kind(), RootKind::Scene);
        assert_eq!(backend.member_count(scene), Some(1));

        let b = sphere(&mut backend);
        let b = composer.add_collider(&mut backend, Some(body), b).unwrap();
        assert_eq!(backend.member_count(scene), Some(2));
        assert_eq!(backend.stats().colliders, 2);

        composer.remove_collider(&mut backend, Some(body), a).unwrap();
        assert_eq!(composer.root_kind(), RootKind::Scene);
        composer.remove_collider(&mut backend, Some(body), b).unwrap();
        assert_eq!(composer.root_kind(), RootKind::Scene);
        assert_eq!(composer.root(), Some(scene));
        assert_eq!(backend.member_count(scene), Some(0));
        assert_eq!(backend.stats().colliders, 0);

        let single = vec![cube(&mut backend)];
        let composer = ShapeComposer::build(&mut backend, true, single).unwrap();
        assert_eq!(composer.root_kind(), RootKind::Scene);
    }

    #[test]
    pub fn test_removing_the_root_is_rejected() {
        let mut backend = RapierBackend::default();
        let shapes = vec![sphere(&mut backend), cube(&mut backend)];
        let mut composer = ShapeComposer::build(&mut backend, false, shapes).unwrap();
        let compound = composer.root().unwrap();
        let result = composer.remove_collider(&mut backend, None, compound);
        assert!(matches!(result, Err(HothamError::StructuralMisuse { .. })));
        assert_eq!(composer.root_kind(), RootKind::Compound);
        assert_eq!(composer.len(), 2);
        assert_eq!(backend.member_count(compound), Some(2));

        let mut empty = ShapeComposer::build(&mut backend, false, vec![]).unwrap();
        let null = empty.root().unwrap();
        let result = empty.remove_collider(&mut backend, None, null);
        assert!(matches!(result, Err(HothamError::StructuralMisuse { .. })));
        assert_eq!(empty.root(), Some(null));

        let mut scene = ShapeComposer::build(&mut backend, true, vec![]).unwrap();
        let root = scene.root().unwrap();
        let result = scene.remove_collider(&mut backend, None, root);
        assert!(matches!(result, Err(HothamError::StructuralMisuse { .. })));
        assert_eq!(scene.root_kind(), RootKind::Scene);
    }

    #[test]
    pub fn test_invalid_collider_is_rejected() {
        let mut backend = RapierBackend::default();
        let shapes = vec![sphere(&mut backend), cube(&mut backend)];
        let mut composer = ShapeComposer::build(&mut backend, false, shapes).unwrap();
        let shapes_before = backend.stats().shapes;

        let null = GeometryShape::null(&mut backend).unwrap();
        let result = composer.add_collider(&mut backend, None, null);
        assert!(matches!(result, Err(HothamError::InvalidShape { .. })));

        let aggregate = GeometryShape::aggregate(&mut backend, AggregateKind::Compound).unwrap();
        let result = composer.add_collider(&mut backend, None, aggregate);
        assert!(matches!(result, Err(HothamError::StructuralMisuse { .. })));

        // Rejected shapes are freed and the existing aggregate is untouched.
        assert_eq!(backend.stats().shapes, shapes_before);
        assert_eq!(composer.root_kind(), RootKind::Compound);
        assert_eq!(backend.member_count(composer.root().unwrap()), Some(2));
    }

    #[test]
    pub fn test_destroy_twice() {
        let mut backend = RapierBackend::default();
        let shapes = vec![sphere(&mut backend), cube(&mut backend)];
        let mut composer = ShapeComposer::build(&mut backend, false, shapes).unwrap();
        assert_eq!(backend.stats().shapes, 3);

        composer.destroy(&mut backend);
        assert_eq!(backend.stats().shapes, 0);
        assert_eq!(composer.root_kind(), RootKind::Detached);
        assert!(composer.root().is_none());

        composer.destroy(&mut backend);
        assert_eq!(backend.stats().shapes, 0);

        let late = sphere(&mut backend);
        assert!(matches!(
            composer.add_collider(&mut backend, None, late),
            Err(HothamError::StructuralMisuse { .. })
        ));
        assert_eq!(backend.stats().shapes, 0);
    }
}
