//! The distributed B-tree (§4.5-§4.6): nodes stored as super-values under
//! coids (`node`), the tree operations that walk and mutate them (`ops`),
//! and the splitter that keeps nodes within the configured size bounds
//! (`splitter`).

pub mod node;
pub mod ops;
pub mod splitter;
