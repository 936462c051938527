//! Subject builders.
//!
//! The caller only hands the engine the entities it explicitly wants
//! saved or removed; everything implied by relations is discovered here.
//! All builders follow the same diff-and-synthesize pattern: compare the
//! entity's current relation state against what the database loader found,
//! and push new subjects or change maps into the shared [`SubjectSet`]
//! accumulator. Builders only ever add, never remove.
//!
//! [`SubjectSet`]: crate::subject::SubjectSet

pub mod cascades;
pub mod many_to_many;
pub mod one_to_many;
pub mod one_to_one_inverse;

pub use cascades::CascadesSubjectBuilder;
pub use many_to_many::ManyToManySubjectBuilder;
pub use one_to_many::OneToManySubjectBuilder;
pub use one_to_one_inverse::OneToOneInverseSideSubjectBuilder;
