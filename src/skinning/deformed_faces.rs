//! 变形面缓存
//!
//! 为整个网格惰性计算并缓存逐顶点的变形后位置，
//! 让同一帧内的大量面/法线/平面查询摊薄成一次线性填充。
//!
//! 填充是对索引流的单次线性遍历，不是逐面遍历：
//! N 个顶点、M ≥ N 条面顶点引用，只做 N 次变形计算。

use glam::Vec3;
use log::trace;

use crate::mesh::{Face, SkinMesh};

use super::skin_section::SkinSection;

/// 逐顶点变形位置缓存
///
/// 槽位用 NAN 哨兵表示"未填"；填充一旦完成，
/// 索引流可达的每个顶点索引恰好被填一次，不会有残留的未填槽。
#[derive(Clone, Debug)]
pub struct DeformedFaceArray {
    /// 变形顶点位置，空表示存储已释放
    locations: Vec<Vec3>,
    /// 整个数组的脏标志
    dirty: bool,
    /// 存储是否为自有分配（注入的存储在失效时不释放）
    owns_storage: bool,
    /// 缓存开关
    should_cache: bool,
}

impl Default for DeformedFaceArray {
    fn default() -> Self {
        Self::new()
    }
}

impl DeformedFaceArray {
    pub(crate) fn new() -> Self {
        Self {
            locations: Vec::new(),
            dirty: true,
            owns_storage: false,
            should_cache: true,
        }
    }

    #[inline]
    pub fn should_cache(&self) -> bool {
        self.should_cache
    }

    pub(crate) fn set_should_cache(&mut self, should_cache: bool) {
        self.should_cache = should_cache;
        if !should_cache {
            self.deallocate();
        }
    }

    #[inline]
    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty || self.locations.is_empty()
    }

    /// 任何影响本网格的骨骼运动都会走到这里
    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
        if self.owns_storage {
            self.deallocate();
        }
    }

    /// 注入外部存储（长度必须等于网格顶点数），注入后不再由本缓存释放
    pub(crate) fn set_deformed_vertex_locations(&mut self, locations: Vec<Vec3>) {
        self.deallocate();
        self.locations = locations;
        self.owns_storage = false;
    }

    fn deallocate(&mut self) {
        if self.owns_storage && !self.locations.is_empty() {
            trace!(
                "deallocating {} deformed vertex locations",
                self.locations.len()
            );
            self.locations = Vec::new();
            self.owns_storage = false;
        }
    }

    /// 已填充的变形顶点位置
    ///
    /// 仅在 `populate` 之后有效；脏读是编程错误。
    #[inline]
    pub(crate) fn location_at(&self, vertex_index: usize) -> Vec3 {
        debug_assert!(!self.is_dirty(), "deformed vertex location read while dirty");
        self.locations[vertex_index]
    }

    /// 从缓存读出一个面
    pub(crate) fn face_at(&self, indices: [usize; 3]) -> Face {
        Face {
            vertices: [
                self.location_at(indices[0]),
                self.location_at(indices[1]),
                self.location_at(indices[2]),
            ],
        }
    }

    /// 单次线性填充
    ///
    /// 沿索引流顺序遍历，维护一个单调推进的"当前分段"游标：
    /// 分段按连续索引区间排列时每步摊还 O(1)，
    /// 乱序时退化为每顶点线性查找（性能回退，不是正确性问题）。
    /// 返回本次实际执行的变形计算次数。
    /// 前置条件：所有分段的绑定矩阵已刷新干净。
    pub(crate) fn populate(&mut self, mesh: &SkinMesh, sections: &[SkinSection]) -> usize {
        let vertex_count = mesh.vertex_count();
        trace!("populating {} deformed vertex locations", vertex_count);

        if self.locations.len() != vertex_count {
            self.locations = vec![Vec3::NAN; vertex_count];
            self.owns_storage = true;
        } else {
            self.locations.fill(Vec3::NAN);
        }

        let index_count = mesh.vertex_index_count();
        let mut computed = 0usize;
        if index_count > 0 {
            assert!(
                !sections.is_empty(),
                "mesh has vertices but no skin sections"
            );
            let mut cursor = 0usize;
            for position in 0..index_count {
                let vertex_index = mesh.vertex_index_at(position);
                // 游标仍指向正确分段时不查找
                if !sections[cursor].contains_vertex_index(vertex_index) {
                    cursor = sections
                        .iter()
                        .position(|s| s.contains_vertex_index(vertex_index))
                        .unwrap_or_else(|| {
                            panic!(
                                "vertex index {} is not covered by any skin section",
                                vertex_index
                            )
                        });
                }
                if self.locations[vertex_index].is_nan() {
                    self.locations[vertex_index] =
                        sections[cursor].deformed_vertex_location(mesh, vertex_index);
                    computed += 1;
                }
            }
        }
        self.dirty = false;
        computed
    }
}
