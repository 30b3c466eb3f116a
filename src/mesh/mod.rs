//! 网格数据层 - 蒙皮核心消费的顶点存储
//!
//! 数据布局（扁平数组，缓存友好）：
//! - 静止姿态顶点位置：`Vec<Vec3>`，长度即顶点数
//! - 骨骼影响：每顶点固定 `influences_per_vertex` 条 (槽位, 权重) 记录，
//!   槽位索引的是所属蒙皮分段的骨骼调色板
//! - 可选索引缓冲：存在时按索引流遍历面，否则按隐式 0..N 序列
//!
//! 权重假定由资产管线预先归一化，这一层不做再归一化。

use glam::{Vec3, Vec4};
use thiserror::Error;

// ============================================================================
// 错误类型
// ============================================================================

/// 网格数据构造错误
#[derive(Debug, Error)]
pub enum MeshDataError {
    #[error("bone influence arrays have {indices} indices / {weights} weights, expected {expected} entries each")]
    InfluenceLengthMismatch {
        indices: usize,
        weights: usize,
        expected: usize,
    },
    #[error("index buffer length {len} is not a multiple of 3")]
    IndexCountNotTriangular { len: usize },
    #[error("index buffer entry {entry} at position {position} exceeds vertex count {vertex_count}")]
    IndexOutOfRange {
        entry: u32,
        position: usize,
        vertex_count: usize,
    },
}

// ============================================================================
// 面
// ============================================================================

/// 三角面的三个顶点位置
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Face {
    pub vertices: [Vec3; 3],
}

impl Face {
    /// 面中心
    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.vertices[0] + self.vertices[1] + self.vertices[2]) / 3.0
    }

    /// 面法线（未归一化输入按逆时针绕序计算，退化面返回零向量）
    #[inline]
    pub fn normal(&self) -> Vec3 {
        let e1 = self.vertices[1] - self.vertices[0];
        let e2 = self.vertices[2] - self.vertices[0];
        e1.cross(e2).normalize_or_zero()
    }

    /// 面所在平面，(nx, ny, nz, d) 形式，满足 n·p + d = 0
    #[inline]
    pub fn plane(&self) -> Vec4 {
        let n = self.normal();
        Vec4::new(n.x, n.y, n.z, -n.dot(self.vertices[0]))
    }
}

// ============================================================================
// 蒙皮网格数据
// ============================================================================

/// 蒙皮网格的静止姿态数据
///
/// 构造后不可变；所有按索引的访问在越界时 panic（编程错误，快速失败）。
#[derive(Clone, Debug)]
pub struct SkinMesh {
    /// 静止姿态顶点位置
    locations: Vec<Vec3>,
    /// 每顶点骨骼影响条数
    influences_per_vertex: usize,
    /// 骨骼槽位，长度 = 顶点数 * influences_per_vertex
    bone_indices: Vec<u16>,
    /// 骨骼权重，与 bone_indices 一一对应
    bone_weights: Vec<f32>,
    /// 索引缓冲，None 表示非索引网格
    indices: Option<Vec<u32>>,
}

impl SkinMesh {
    /// 构造并校验网格数据
    pub fn new(
        locations: Vec<Vec3>,
        influences_per_vertex: usize,
        bone_indices: Vec<u16>,
        bone_weights: Vec<f32>,
        indices: Option<Vec<u32>>,
    ) -> Result<Self, MeshDataError> {
        let expected = locations.len() * influences_per_vertex;
        if bone_indices.len() != expected || bone_weights.len() != expected {
            return Err(MeshDataError::InfluenceLengthMismatch {
                indices: bone_indices.len(),
                weights: bone_weights.len(),
                expected,
            });
        }
        if let Some(ref idx) = indices {
            if idx.len() % 3 != 0 {
                return Err(MeshDataError::IndexCountNotTriangular { len: idx.len() });
            }
            for (position, &entry) in idx.iter().enumerate() {
                if entry as usize >= locations.len() {
                    return Err(MeshDataError::IndexOutOfRange {
                        entry,
                        position,
                        vertex_count: locations.len(),
                    });
                }
            }
        }
        Ok(Self {
            locations,
            influences_per_vertex,
            bone_indices,
            bone_weights,
            indices,
        })
    }

    /// 顶点数
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.locations.len()
    }

    /// 静止姿态顶点位置
    #[inline]
    pub fn vertex_location(&self, vertex_index: usize) -> Vec3 {
        self.locations[vertex_index]
    }

    /// 每顶点骨骼影响条数
    #[inline]
    pub fn influence_count(&self) -> usize {
        self.influences_per_vertex
    }

    /// 第 `influence` 条影响记录的骨骼槽位
    #[inline]
    pub fn bone_index(&self, influence: usize, vertex_index: usize) -> usize {
        debug_assert!(influence < self.influences_per_vertex);
        self.bone_indices[vertex_index * self.influences_per_vertex + influence] as usize
    }

    /// 第 `influence` 条影响记录的权重
    #[inline]
    pub fn bone_weight(&self, influence: usize, vertex_index: usize) -> f32 {
        debug_assert!(influence < self.influences_per_vertex);
        self.bone_weights[vertex_index * self.influences_per_vertex + influence]
    }

    /// 是否为索引网格
    #[inline]
    pub fn is_indexed(&self) -> bool {
        self.indices.is_some()
    }

    /// 索引流长度：索引网格为索引数，否则为顶点数
    #[inline]
    pub fn vertex_index_count(&self) -> usize {
        match self.indices {
            Some(ref idx) => idx.len(),
            None => self.locations.len(),
        }
    }

    /// 索引流中第 `position` 处的顶点索引
    #[inline]
    pub fn vertex_index_at(&self, position: usize) -> usize {
        match self.indices {
            Some(ref idx) => idx[position] as usize,
            None => position,
        }
    }

    /// 面数
    #[inline]
    pub fn face_count(&self) -> usize {
        self.vertex_index_count() / 3
    }

    /// 面 → 顶点索引三元组
    #[inline]
    pub fn face_indices(&self, face_index: usize) -> [usize; 3] {
        assert!(
            face_index < self.face_count(),
            "face index {} out of range for mesh with {} faces",
            face_index,
            self.face_count()
        );
        let base = face_index * 3;
        [
            self.vertex_index_at(base),
            self.vertex_index_at(base + 1),
            self.vertex_index_at(base + 2),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_quad() -> SkinMesh {
        // 两个三角形共享一条对角边的四边形
        SkinMesh::new(
            vec![
                Vec3::new(0.0, 0.0, 0.0),
                Vec3::new(1.0, 0.0, 0.0),
                Vec3::new(1.0, 1.0, 0.0),
                Vec3::new(0.0, 1.0, 0.0),
            ],
            1,
            vec![0, 0, 0, 0],
            vec![1.0, 1.0, 1.0, 1.0],
            Some(vec![0, 1, 2, 0, 2, 3]),
        )
        .unwrap()
    }

    #[test]
    fn test_influence_length_validation() {
        let err = SkinMesh::new(
            vec![Vec3::ZERO; 2],
            2,
            vec![0, 0, 0], // 缺一条
            vec![1.0; 4],
            None,
        );
        assert!(matches!(
            err,
            Err(MeshDataError::InfluenceLengthMismatch { expected: 4, .. })
        ));
    }

    #[test]
    fn test_index_validation() {
        let err = SkinMesh::new(
            vec![Vec3::ZERO; 3],
            1,
            vec![0; 3],
            vec![1.0; 3],
            Some(vec![0, 1, 3]), // 3 越界
        );
        assert!(matches!(err, Err(MeshDataError::IndexOutOfRange { entry: 3, .. })));

        let err = SkinMesh::new(
            vec![Vec3::ZERO; 3],
            1,
            vec![0; 3],
            vec![1.0; 3],
            Some(vec![0, 1]),
        );
        assert!(matches!(
            err,
            Err(MeshDataError::IndexCountNotTriangular { len: 2 })
        ));
    }

    #[test]
    fn test_face_queries() {
        let mesh = unit_quad();
        assert_eq!(mesh.face_count(), 2);
        assert_eq!(mesh.face_indices(1), [0, 2, 3]);

        let face = Face {
            vertices: [
                mesh.vertex_location(0),
                mesh.vertex_location(1),
                mesh.vertex_location(2),
            ],
        };
        assert!((face.normal() - Vec3::Z).length() < 1e-6);
        assert!((face.center() - Vec3::new(2.0 / 3.0, 1.0 / 3.0, 0.0)).length() < 1e-6);
        // 平面过原点，d = 0
        assert!(face.plane().w.abs() < 1e-6);
    }

    #[test]
    fn test_implicit_index_stream() {
        let mesh = SkinMesh::new(
            vec![Vec3::ZERO; 6],
            1,
            vec![0; 6],
            vec![1.0; 6],
            None,
        )
        .unwrap();
        assert!(!mesh.is_indexed());
        assert_eq!(mesh.vertex_index_count(), 6);
        assert_eq!(mesh.vertex_index_at(4), 4);
        assert_eq!(mesh.face_count(), 2);
    }
}
