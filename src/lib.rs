//! CPU 蒙皮核心 - 骨骼网格变形引擎
//!
//! 核心设计思想：
//! - scene: 通用场景节点层（局部/全局变换的惰性缓存、脏标记传播、软体根节点）
//! - mesh: 网格数据层（静止姿态顶点、逐顶点骨骼权重、索引流、面查询）
//! - skinning: 蒙皮核心（骨骼、骨骼绑定、蒙皮分段、变形面缓存、软体门面）
//!
//! 整个子系统是单线程同步的：所有惰性重算都发生在查询线程上，
//! 仅由脏标记保护，没有任何内部锁。

pub mod mesh;
pub mod scene;
pub mod skinning;

pub use mesh::{Face, MeshDataError, SkinMesh};
pub use scene::{NodeId, NodeSet, Transform};
pub use skinning::{
    Bone, BoneBinding, BoneId, DeformedFaceArray, MeshId, SkinBatch, SkinError, SkinMeshNode,
    SkinSection, SoftBody,
};
