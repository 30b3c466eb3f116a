//! 软体门面 - 角色级的装配、分发与查询入口
//!
//! 设计原则：
//! - SoftBody 独占持有节点集合与骨骼/网格 arena，句柄向外发放
//! - 所有姿态写入都经由这里，变换层报告受影响节点后立即同步分发：
//!   骨骼动 → 骨骼空间缓存脏 → 订阅它的每条绑定脏 → 所属网格面缓存清空
//! - 销毁子树时向订阅者广播，绑定把对应引用置空而不是悬空
//!
//! 观察者列表存非拥有句柄（BindingKey），绑定绝不延长骨骼或网格的生命周期。

use std::collections::HashMap;

use glam::{Mat4, Quat, Vec3, Vec4};
use log::{debug, trace};

use crate::mesh::{Face, SkinMesh};
use crate::scene::{NodeId, NodeSet, Transform};

use super::bone::Bone;
use super::skin_mesh_node::SkinMeshNode;
use super::skin_section::{BoneBinding, SkinSection};
use super::{BindingKey, BoneId, MeshId, SkinError};

/// 软体角色
#[derive(Clone, Debug)]
pub struct SoftBody {
    /// 场景节点集合
    nodes: NodeSet,
    /// 软体根节点（骨骼空间锚点），装配后不再变更
    root: NodeId,
    /// 骨骼 arena，槽位销毁后置 None
    bones: Vec<Option<Bone>>,
    /// 蒙皮网格节点 arena
    meshes: Vec<Option<SkinMeshNode>>,
    /// 节点 → 骨骼映射
    node_bones: HashMap<NodeId, BoneId>,
    /// 节点 → 蒙皮网格映射
    node_meshes: HashMap<NodeId, MeshId>,
    /// 受影响节点的复用缓冲
    affected: Vec<NodeId>,
}

impl SoftBody {
    /// 创建角色，根节点即软体根
    pub fn new(name: &str) -> Self {
        let mut nodes = NodeSet::new();
        let root = nodes.add_node(name, None);
        nodes.mark_soft_body_root(root);
        Self {
            nodes,
            root,
            bones: Vec::new(),
            meshes: Vec::new(),
            node_bones: HashMap::new(),
            node_meshes: HashMap::new(),
            affected: Vec::new(),
        }
    }

    /// 软体根节点
    #[inline]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// 场景节点集合（只读）
    #[inline]
    pub fn node_set(&self) -> &NodeSet {
        &self.nodes
    }

    // ========================================
    // 装配
    // ========================================

    /// 创建普通中间节点
    pub fn add_node(&mut self, name: &str, parent: NodeId) -> Result<NodeId, SkinError> {
        if !self.nodes.is_alive(parent) {
            return Err(SkinError::DeadNode);
        }
        Ok(self.nodes.add_node(name, Some(parent)))
    }

    /// 创建骨骼节点
    pub fn add_bone(&mut self, name: &str, parent: NodeId) -> Result<BoneId, SkinError> {
        if !self.nodes.is_alive(parent) {
            return Err(SkinError::DeadNode);
        }
        let node = self.nodes.add_node(name, Some(parent));
        let id = BoneId(self.bones.len());
        self.bones.push(Some(Bone::new(name.to_string(), node)));
        self.node_bones.insert(node, id);
        Ok(id)
    }

    /// 创建蒙皮网格节点并接管网格数据
    pub fn add_skin_mesh(
        &mut self,
        name: &str,
        parent: NodeId,
        mesh: SkinMesh,
    ) -> Result<MeshId, SkinError> {
        if !self.nodes.is_alive(parent) {
            return Err(SkinError::DeadNode);
        }
        let node = self.nodes.add_node(name, Some(parent));
        let id = MeshId(self.meshes.len());
        self.meshes
            .push(Some(SkinMeshNode::new(name.to_string(), node, mesh)));
        self.node_meshes.insert(node, id);
        Ok(id)
    }

    /// 追加蒙皮分段，必须紧接上一分段的区间末尾
    pub fn add_section(
        &mut self,
        mesh: MeshId,
        vertex_start: usize,
        vertex_count: usize,
    ) -> Result<usize, SkinError> {
        let node = self.mesh_node_checked_mut(mesh)?;
        let expected = node
            .sections()
            .last()
            .map_or(0, |s| s.vertex_start() + s.vertex_count());
        if vertex_start != expected {
            return Err(SkinError::NonContiguousSection {
                expected,
                got: vertex_start,
            });
        }
        let end = vertex_start + vertex_count;
        if end > node.mesh().vertex_count() {
            return Err(SkinError::SectionOutOfRange {
                start: vertex_start,
                end,
                vertex_count: node.mesh().vertex_count(),
            });
        }
        Ok(node.push_section(SkinSection::new(vertex_start, vertex_count)))
    }

    /// 把骨骼追加到分段调色板，返回槽位
    ///
    /// 创建绑定并把它注册为骨骼的变换观察者；
    /// 网格一侧的注册由所有权关系承担（网格节点直接标记自有绑定）。
    pub fn add_bone_to_section(
        &mut self,
        mesh: MeshId,
        section: usize,
        bone: BoneId,
    ) -> Result<usize, SkinError> {
        if self.bones.get(bone.0).map_or(true, |b| b.is_none()) {
            return Err(SkinError::DeadBone);
        }
        let node = self.mesh_node_checked_mut(mesh)?;
        let section_count = node.sections().len();
        if section >= section_count {
            return Err(SkinError::NoSuchSection {
                section,
                count: section_count,
            });
        }
        let slot = node.sections_mut()[section].push_binding(BoneBinding::new(bone));
        self.bones[bone.0]
            .as_mut()
            .unwrap()
            .listeners
            .push(BindingKey {
                mesh,
                section,
                slot,
            });
        Ok(slot)
    }

    /// 校验各分段恰好划分 [0, vertex_count)，无缝隙无重叠
    ///
    /// 连续性在 add_section 时已强制，这里只需检查覆盖到末尾。
    pub fn validate_sections(&self, mesh: MeshId) -> Result<(), SkinError> {
        let node = self.mesh_node_checked(mesh)?;
        let covered = node
            .sections()
            .last()
            .map_or(0, |s| s.vertex_start() + s.vertex_count());
        if covered != node.mesh().vertex_count() {
            return Err(SkinError::IncompleteCoverage {
                covered,
                vertex_count: node.mesh().vertex_count(),
            });
        }
        Ok(())
    }

    /// 捕获静止（绑定）姿态
    ///
    /// 必须在骨架摆入参考姿态之后、任何变形查询之前调用一次；
    /// 再次调用会把后续变形重新基准化到新的参考姿态。
    pub fn bind_rest_pose(&mut self) {
        let Self {
            nodes,
            bones,
            meshes,
            ..
        } = self;
        let mut count = 0usize;
        for bone in bones.iter_mut().flatten() {
            bone.bind_rest_pose(nodes);
            count += 1;
        }
        // 重新基准化后所有绑定矩阵与面缓存都失效
        for mesh in meshes.iter_mut().flatten() {
            for section in mesh.sections_mut() {
                section.mark_bindings_dirty();
            }
            mesh.bone_was_transformed();
        }
        debug!("rest pose bound for {} bones", count);
    }

    // ========================================
    // 销毁
    // ========================================

    /// 销毁节点及其子树，向观察者广播
    pub fn remove_subtree(&mut self, node: NodeId) {
        assert!(node != self.root, "cannot remove the soft body root");
        let mut removed = Vec::new();
        self.nodes.remove_subtree(node, &mut removed);

        // 先处理被销毁的网格节点：广播给自有绑定并从骨骼订阅者列表退订
        for &id in &removed {
            if let Some(mid) = self.node_meshes.remove(&id) {
                if let Some(mesh) = self.meshes[mid.0].as_mut() {
                    for section in mesh.sections_mut() {
                        for slot in 0..section.bone_count() {
                            section.binding_mut(slot).on_mesh_destroyed();
                        }
                    }
                }
                for bone in self.bones.iter_mut().flatten() {
                    bone.listeners.retain(|k| k.mesh != mid);
                }
                self.meshes[mid.0] = None;
            }
        }
        // 再广播被销毁的骨骼：幸存的绑定把骨骼引用置空
        for &id in &removed {
            if let Some(bid) = self.node_bones.remove(&id) {
                let bone = self.bones[bid.0].take().unwrap();
                for key in bone.listeners {
                    if let Some(mesh) = self.meshes[key.mesh.0].as_mut() {
                        mesh.sections_mut()[key.section]
                            .binding_mut(key.slot)
                            .on_bone_destroyed();
                        mesh.bone_was_transformed();
                    }
                }
            }
        }
        debug!("destroyed {} nodes", removed.len());
    }

    /// 销毁整个蒙皮网格节点子树
    pub fn remove_skin_mesh(&mut self, mesh: MeshId) -> Result<(), SkinError> {
        let node = self.mesh_node_checked(mesh)?.node();
        self.remove_subtree(node);
        Ok(())
    }

    // ========================================
    // 姿态写入（同步分发失效）
    // ========================================

    pub fn set_local_transform(&mut self, node: NodeId, transform: Transform) {
        let mut affected = std::mem::take(&mut self.affected);
        self.nodes.set_local_transform(node, transform, &mut affected);
        self.dispatch_transform_changes(&affected);
        affected.clear();
        self.affected = affected;
    }

    pub fn set_local_translation(&mut self, node: NodeId, translation: Vec3) {
        let mut affected = std::mem::take(&mut self.affected);
        self.nodes
            .set_local_translation(node, translation, &mut affected);
        self.dispatch_transform_changes(&affected);
        affected.clear();
        self.affected = affected;
    }

    pub fn set_local_rotation(&mut self, node: NodeId, rotation: Quat) {
        let mut affected = std::mem::take(&mut self.affected);
        self.nodes.set_local_rotation(node, rotation, &mut affected);
        self.dispatch_transform_changes(&affected);
        affected.clear();
        self.affected = affected;
    }

    pub fn set_local_scale(&mut self, node: NodeId, scale: Vec3) {
        let mut affected = std::mem::take(&mut self.affected);
        self.nodes.set_local_scale(node, scale, &mut affected);
        self.dispatch_transform_changes(&affected);
        affected.clear();
        self.affected = affected;
    }

    /// 把变换层报告的受影响节点分发给各观察者
    fn dispatch_transform_changes(&mut self, affected: &[NodeId]) {
        for &id in affected {
            if let Some(&bid) = self.node_bones.get(&id) {
                let bone = self.bones[bid.0].as_mut().unwrap();
                bone.mark_transform_dirty();
                let keys = bone.listeners.clone();
                for key in keys {
                    if let Some(mesh) = self.meshes[key.mesh.0].as_mut() {
                        mesh.sections_mut()[key.section]
                            .binding_mut(key.slot)
                            .mark_dirty();
                        mesh.bone_was_transformed();
                    }
                }
            }
            if let Some(&mid) = self.node_meshes.get(&id) {
                self.meshes[mid.0].as_mut().unwrap().mark_transform_dirty();
            }
        }
        trace!("dispatched transform changes for {} nodes", affected.len());
    }

    // ========================================
    // 访问器
    // ========================================

    pub fn local_transform(&self, node: NodeId) -> Transform {
        self.nodes.node(node).local_transform()
    }

    pub fn global_transform(&mut self, node: NodeId) -> Mat4 {
        self.nodes.global_transform(node)
    }

    /// 骨骼引用，句柄失效时 panic
    pub fn bone(&self, bone: BoneId) -> &Bone {
        self.bones[bone.0]
            .as_ref()
            .unwrap_or_else(|| panic!("bone handle {:?} refers to a destroyed bone", bone))
    }

    /// 蒙皮网格节点引用，句柄失效时 panic
    pub fn skin_mesh(&self, mesh: MeshId) -> &SkinMeshNode {
        self.mesh_node(mesh)
    }

    fn mesh_node(&self, mesh: MeshId) -> &SkinMeshNode {
        self.meshes[mesh.0]
            .as_ref()
            .unwrap_or_else(|| panic!("mesh handle {:?} refers to a destroyed skin mesh", mesh))
    }

    fn mesh_node_mut(&mut self, mesh: MeshId) -> &mut SkinMeshNode {
        self.meshes[mesh.0]
            .as_mut()
            .unwrap_or_else(|| panic!("mesh handle {:?} refers to a destroyed skin mesh", mesh))
    }

    fn mesh_node_checked(&self, mesh: MeshId) -> Result<&SkinMeshNode, SkinError> {
        self.meshes
            .get(mesh.0)
            .and_then(|m| m.as_ref())
            .ok_or(SkinError::DeadMesh)
    }

    fn mesh_node_checked_mut(&mut self, mesh: MeshId) -> Result<&mut SkinMeshNode, SkinError> {
        self.meshes
            .get_mut(mesh.0)
            .and_then(|m| m.as_mut())
            .ok_or(SkinError::DeadMesh)
    }

    // ========================================
    // 骨架查询
    // ========================================

    /// 网格是否有骨架
    pub fn has_skeleton(&self, mesh: MeshId) -> bool {
        self.mesh_node(mesh).has_skeleton()
    }

    /// 骨架是否刚性：至少一根存活骨骼，且每根的骨骼空间变换都是纯旋转 + 平移
    ///
    /// 刚性骨架允许协作方沿用绑定时刻量好的包围球而无须重新测量。
    pub fn has_rigid_skeleton(&mut self, mesh: MeshId) -> bool {
        let Self {
            nodes,
            bones,
            meshes,
            ..
        } = self;
        let node = meshes[mesh.0]
            .as_ref()
            .unwrap_or_else(|| panic!("mesh handle {:?} refers to a destroyed skin mesh", mesh));
        let mut live_bones = 0usize;
        for section in node.sections() {
            for binding in section.bindings() {
                let Some(bid) = binding.bone() else { continue };
                live_bones += 1;
                let bone = bones[bid.0].as_mut().unwrap();
                if !bone.has_rigid_skeletal_transform(nodes) {
                    return false;
                }
            }
        }
        live_bones > 0
    }

    // ========================================
    // 绑定矩阵
    // ========================================

    /// 刷新一个分段的全部绑定矩阵
    ///
    /// 复合顺序（右侧先作用）：
    /// 网格骨骼空间逆 * 骨骼骨骼空间 * 骨骼静止姿态逆 * 网格骨骼空间。
    /// 两端的网格因子把网格自身的运动抵消，只留下骨骼相对静止姿态的运动。
    fn refresh_section_bindings(&mut self, mesh: MeshId, section: usize) {
        let Self {
            nodes,
            bones,
            meshes,
            ..
        } = self;
        let node = meshes[mesh.0]
            .as_mut()
            .unwrap_or_else(|| panic!("mesh handle {:?} refers to a destroyed skin mesh", mesh));
        let mesh_skeletal = node.skeletal_transform(nodes);
        let mesh_skeletal_inverse = node.skeletal_transform_inverse(nodes);
        let sec = &mut node.sections_mut()[section];
        for slot in 0..sec.bone_count() {
            if !sec.bindings()[slot].is_dirty() {
                continue;
            }
            let bone_id = sec.bindings()[slot].bone().unwrap_or_else(|| {
                panic!("bone binding queried after its bone was destroyed")
            });
            let bone = bones[bone_id.0].as_mut().unwrap();
            let transform = mesh_skeletal_inverse
                * bone.skeletal_transform(nodes)
                * bone.rest_pose_inverse()
                * mesh_skeletal;
            sec.binding_mut(slot).store_transform(transform);
        }
    }

    /// 指定槽位的绑定矩阵，脏时重算
    pub fn bone_binding_transform(&mut self, mesh: MeshId, section: usize, slot: usize) -> Mat4 {
        self.refresh_section_bindings(mesh, section);
        self.mesh_node(mesh).sections()[section].bindings()[slot].transform()
    }

    /// 刷新网格全部绑定矩阵与调色板，之后 `SkinMeshNode::batches` 有效
    pub fn update_pose(&mut self, mesh: MeshId) {
        let section_count = self.mesh_node(mesh).sections().len();
        for section in 0..section_count {
            self.refresh_section_bindings(mesh, section);
        }
        for section in self.mesh_node_mut(mesh).sections_mut() {
            section.refresh_palette();
        }
    }

    // ========================================
    // 变形查询
    // ========================================

    /// 顶点的变形后位置（网格局部空间）
    ///
    /// 面缓存开启时从缓存读取，否则经所属分段直接计算。
    /// 顶点索引越界是编程错误。
    pub fn deformed_vertex_location_at(&mut self, mesh: MeshId, vertex_index: usize) -> Vec3 {
        let section = self.mesh_node(mesh).section_index_for_vertex(vertex_index);
        if self.mesh_node_mut(mesh).deformed_faces_mut().should_cache() {
            self.ensure_face_cache(mesh);
            return self
                .mesh_node(mesh)
                .deformed_faces()
                .unwrap()
                .location_at(vertex_index);
        }
        self.refresh_section_bindings(mesh, section);
        let node = self.mesh_node(mesh);
        node.sections()[section].deformed_vertex_location(node.mesh(), vertex_index)
    }

    /// 面的三个变形后顶点位置
    pub fn deformed_face_at(&mut self, mesh: MeshId, face_index: usize) -> Face {
        let indices = self.mesh_node(mesh).mesh().face_indices(face_index);
        if self.mesh_node_mut(mesh).deformed_faces_mut().should_cache() {
            self.ensure_face_cache(mesh);
            return self
                .mesh_node(mesh)
                .deformed_faces()
                .unwrap()
                .face_at(indices);
        }
        let section = self.mesh_node(mesh).section_index_for_face(face_index);
        self.refresh_section_bindings(mesh, section);
        let node = self.mesh_node(mesh);
        let sec = &node.sections()[section];
        Face {
            vertices: [
                sec.deformed_vertex_location(node.mesh(), indices[0]),
                sec.deformed_vertex_location(node.mesh(), indices[1]),
                sec.deformed_vertex_location(node.mesh(), indices[2]),
            ],
        }
    }

    /// 变形后面中心
    pub fn deformed_face_center_at(&mut self, mesh: MeshId, face_index: usize) -> Vec3 {
        self.deformed_face_at(mesh, face_index).center()
    }

    /// 变形后面法线
    pub fn deformed_face_normal_at(&mut self, mesh: MeshId, face_index: usize) -> Vec3 {
        self.deformed_face_at(mesh, face_index).normal()
    }

    /// 变形后面所在平面
    pub fn deformed_face_plane_at(&mut self, mesh: MeshId, face_index: usize) -> Vec4 {
        self.deformed_face_at(mesh, face_index).plane()
    }

    /// 开关面缓存
    pub fn set_should_cache_faces(&mut self, mesh: MeshId, should_cache: bool) {
        self.mesh_node_mut(mesh).set_should_cache_faces(should_cache);
    }

    /// 注入外部的变形顶点存储（长度必须等于网格顶点数）
    ///
    /// 注入的存储在失效时只标脏不释放，供与协作方共享缓冲时使用。
    pub fn set_deformed_vertex_storage(&mut self, mesh: MeshId, locations: Vec<Vec3>) {
        assert_eq!(
            locations.len(),
            self.mesh_node(mesh).mesh().vertex_count(),
            "injected storage length must equal the mesh vertex count"
        );
        self.mesh_node_mut(mesh)
            .deformed_faces_mut()
            .set_deformed_vertex_locations(locations);
    }

    /// 确保面缓存已填充，返回本次执行的变形计算次数（已干净时为 0）
    pub(crate) fn ensure_face_cache(&mut self, mesh: MeshId) -> usize {
        let section_count = self.mesh_node(mesh).sections().len();
        for section in 0..section_count {
            self.refresh_section_bindings(mesh, section);
        }
        let node = self.mesh_node_mut(mesh);
        let (mesh_data, sections, faces) = node.split_for_population();
        if faces.is_dirty() {
            faces.populate(mesh_data, sections)
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn v(x: f32, y: f32, z: f32) -> Vec3 {
        Vec3::new(x, y, z)
    }

    /// 两根骨骼、四个顶点的测试角色
    ///
    /// bone_a 在原点，bone_b 在 (2,0,0)；顶点沿 X 轴排布，
    /// 权重从 bone_a 渐变到 bone_b，全部落在一个分段里。
    fn two_bone_character() -> (SoftBody, MeshId, BoneId, BoneId) {
        init_logger();
        let mut body = SoftBody::new("character");
        let bone_a = body.add_bone("bone_a", body.root()).unwrap();
        let bone_b = body.add_bone("bone_b", body.root()).unwrap();
        let b_node = body.bone(bone_b).node();
        body.set_local_translation(b_node, v(2.0, 0.0, 0.0));

        let mesh = SkinMesh::new(
            vec![
                v(0.0, 0.0, 0.0),
                v(1.0, 0.0, 0.0),
                v(2.0, 0.0, 0.0),
                v(3.0, 0.0, 0.0),
            ],
            2,
            vec![0, 1, 0, 1, 0, 1, 0, 1],
            vec![1.0, 0.0, 0.7, 0.3, 0.3, 0.7, 0.0, 1.0],
            Some(vec![0, 1, 2, 0, 2, 3]),
        )
        .unwrap();
        let mesh_id = body.add_skin_mesh("skin", body.root(), mesh).unwrap();
        let section = body.add_section(mesh_id, 0, 4).unwrap();
        body.add_bone_to_section(mesh_id, section, bone_a).unwrap();
        body.add_bone_to_section(mesh_id, section, bone_b).unwrap();
        body.validate_sections(mesh_id).unwrap();
        body.bind_rest_pose();
        (body, mesh_id, bone_a, bone_b)
    }

    #[test]
    fn test_rest_pose_round_trip() {
        let (mut body, mesh, _, _) = two_bone_character();
        // 绑定时刻的变形是恒等：每个顶点回到静止位置
        for i in 0..4 {
            let rest = body.skin_mesh(mesh).mesh().vertex_location(i);
            let deformed = body.deformed_vertex_location_at(mesh, i);
            assert!(
                (deformed - rest).length() < 1e-5,
                "vertex {} deformed to {:?}, rest {:?}",
                i,
                deformed,
                rest
            );
        }
    }

    #[test]
    fn test_invalidation_on_bone_motion() {
        let (mut body, mesh, bone_a, _) = two_bone_character();

        // 移动前查询：旧姿态（静止位置）
        let before = body.deformed_vertex_location_at(mesh, 0);
        assert!((before - v(0.0, 0.0, 0.0)).length() < 1e-5);

        // 移动 bone_a，顶点 0 全权重跟随
        let a_node = body.bone(bone_a).node();
        body.set_local_translation(a_node, v(0.0, 1.0, 0.0));
        let after = body.deformed_vertex_location_at(mesh, 0);
        assert!(
            (after - v(0.0, 1.0, 0.0)).length() < 1e-5,
            "query after motion must observe the new pose, got {:?}",
            after
        );
    }

    #[test]
    fn test_weighted_sum_matches_single_bone_transforms() {
        let (mut body, mesh, bone_a, bone_b) = two_bone_character();
        let a_node = body.bone(bone_a).node();
        let b_node = body.bone(bone_b).node();
        body.set_local_translation(a_node, v(0.0, 1.0, 0.0));
        body.set_local_transform(
            b_node,
            Transform {
                translation: v(2.0, 0.0, 1.0),
                rotation: Quat::from_rotation_z(0.5),
                scale: Vec3::ONE,
            },
        );

        // 顶点 1：{(bone_a, 0.7), (bone_b, 0.3)}
        let rest = body.skin_mesh(mesh).mesh().vertex_location(1);
        let ta = body.bone_binding_transform(mesh, 0, 0);
        let tb = body.bone_binding_transform(mesh, 0, 1);
        let expected = ta.transform_point3(rest) * 0.7 + tb.transform_point3(rest) * 0.3;

        let deformed = body.deformed_vertex_location_at(mesh, 1);
        assert!((deformed - expected).length() < 1e-6);
    }

    #[test]
    fn test_mesh_motion_independence() {
        let (mut body, mesh, _, _) = two_bone_character();
        let before = body.bone_binding_transform(mesh, 0, 0);
        let before_b = body.bone_binding_transform(mesh, 0, 1);

        // 整体平移网格节点，骨骼未动：重算后的绑定矩阵必须逐位相等
        let mesh_node = body.skin_mesh(mesh).node();
        body.set_local_translation(mesh_node, v(10.0, 0.0, 0.0));
        let after = body.bone_binding_transform(mesh, 0, 0);
        let after_b = body.bone_binding_transform(mesh, 0, 1);
        assert_eq!(before, after);
        assert_eq!(before_b, after_b);
    }

    #[test]
    fn test_soft_body_root_motion_does_not_deform() {
        let (mut body, mesh, _, _) = two_bone_character();
        let before = body.deformed_vertex_location_at(mesh, 2);

        // 移动整个角色（软体根）：骨骼空间矩阵不变，变形不变
        let root = body.root();
        body.set_local_transform(
            root,
            Transform {
                translation: v(-5.0, 3.0, 8.0),
                rotation: Quat::from_rotation_y(1.0),
                scale: Vec3::ONE,
            },
        );
        let after = body.deformed_vertex_location_at(mesh, 2);
        // 根节点带旋转，逆矩阵有浮点误差，容差放宽
        assert!((before - after).length() < 1e-4);
    }

    #[test]
    fn test_section_partition_validation() {
        init_logger();
        let mut body = SoftBody::new("character");
        let mesh = SkinMesh::new(vec![Vec3::ZERO; 6], 1, vec![0; 6], vec![1.0; 6], None).unwrap();
        let mesh_id = body.add_skin_mesh("skin", body.root(), mesh).unwrap();

        // 覆盖不全时校验失败
        body.add_section(mesh_id, 0, 2).unwrap();
        assert!(matches!(
            body.validate_sections(mesh_id),
            Err(SkinError::IncompleteCoverage {
                covered: 2,
                vertex_count: 6
            })
        ));

        // 缝隙与重叠都被拒绝
        assert!(matches!(
            body.add_section(mesh_id, 3, 2),
            Err(SkinError::NonContiguousSection {
                expected: 2,
                got: 3
            })
        ));
        assert!(matches!(
            body.add_section(mesh_id, 1, 2),
            Err(SkinError::NonContiguousSection {
                expected: 2,
                got: 1
            })
        ));
        // 超出网格末尾被拒绝
        assert!(matches!(
            body.add_section(mesh_id, 2, 5),
            Err(SkinError::SectionOutOfRange { .. })
        ));

        body.add_section(mesh_id, 2, 4).unwrap();
        body.validate_sections(mesh_id).unwrap();
    }

    #[test]
    fn test_face_cache_single_pass_and_idempotent() {
        let (mut body, mesh, _, _) = two_bone_character();
        // 索引流有 6 条引用，顶点只有 4 个：恰好 4 次变形计算
        let computed = body.ensure_face_cache(mesh);
        assert_eq!(computed, 4);
        // 无失效时不再填充
        assert_eq!(body.ensure_face_cache(mesh), 0);

        // 再次填充（无中间失效）必须逐位一致
        let first: Vec<Vec3> = (0..4)
            .map(|i| body.skin_mesh(mesh).deformed_faces().unwrap().location_at(i))
            .collect();
        let node = body.mesh_node_mut(mesh);
        let (mesh_data, sections, faces) = node.split_for_population();
        let recomputed = faces.populate(mesh_data, sections);
        assert_eq!(recomputed, 4);
        for (i, &loc) in first.iter().enumerate() {
            let again = body.skin_mesh(mesh).deformed_faces().unwrap().location_at(i);
            assert_eq!(loc, again, "vertex {} changed across populations", i);
        }
    }

    #[test]
    fn test_face_cache_invalidation_on_bone_motion() {
        let (mut body, mesh, bone_a, _) = two_bone_character();
        let face_before = body.deformed_face_at(mesh, 0);

        let a_node = body.bone(bone_a).node();
        body.set_local_translation(a_node, v(0.0, 2.0, 0.0));
        let face_after = body.deformed_face_at(mesh, 0);
        // 顶点 0 全权重跟随 bone_a
        assert!((face_after.vertices[0] - v(0.0, 2.0, 0.0)).length() < 1e-5);
        assert!((face_before.vertices[0] - v(0.0, 0.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_face_queries_with_cache_disabled() {
        let (mut body, mesh, bone_a, _) = two_bone_character();
        let a_node = body.bone(bone_a).node();
        body.set_local_translation(a_node, v(0.0, 1.0, 0.0));

        let cached = body.deformed_face_at(mesh, 1);
        body.set_should_cache_faces(mesh, false);
        let direct = body.deformed_face_at(mesh, 1);
        for k in 0..3 {
            assert!((cached.vertices[k] - direct.vertices[k]).length() < 1e-6);
        }
        // 法线与平面查询走同一条路径
        let n = body.deformed_face_normal_at(mesh, 1);
        assert!((n.length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_rigidity_detection() {
        let (mut body, mesh, _, bone_b) = two_bone_character();
        assert!(body.has_rigid_skeleton(mesh));

        // 引入非均匀缩放，下一次查询翻转为 false
        let b_node = body.bone(bone_b).node();
        body.set_local_scale(b_node, v(1.0, 2.0, 1.0));
        assert!(!body.has_rigid_skeleton(mesh));

        // 恢复刚性
        body.set_local_scale(b_node, Vec3::ONE);
        assert!(body.has_rigid_skeleton(mesh));
    }

    #[test]
    fn test_no_skeleton_reports_false() {
        init_logger();
        let mut body = SoftBody::new("character");
        // 全零权重：退化但合法，顶点变形为零向量
        let mesh = SkinMesh::new(vec![v(1.0, 2.0, 3.0); 3], 1, vec![0; 3], vec![0.0; 3], None)
            .unwrap();
        let mesh_id = body.add_skin_mesh("skin", body.root(), mesh).unwrap();
        body.add_section(mesh_id, 0, 3).unwrap();
        body.bind_rest_pose();

        assert!(!body.has_skeleton(mesh_id));
        assert!(!body.has_rigid_skeleton(mesh_id));
        let deformed = body.deformed_vertex_location_at(mesh_id, 0);
        assert_eq!(deformed, Vec3::ZERO);
    }

    #[test]
    fn test_dangling_reference_safety() {
        let (mut body, mesh, bone_a, _) = two_bone_character();

        // 销毁仍有活跃绑定的骨骼
        let a_node = body.bone(bone_a).node();
        body.remove_subtree(a_node);

        // 分段的骨骼数查询不得崩溃，绑定的骨骼引用已被置空
        let section = &body.skin_mesh(mesh).sections()[0];
        assert_eq!(section.bone_count(), 2);
        assert!(section.bindings()[0].bone().is_none());
        assert!(section.bindings()[1].bone().is_some());

        // 随后销毁持有这些绑定的网格同样安全
        body.remove_skin_mesh(mesh).unwrap();
        assert!(matches!(
            body.remove_skin_mesh(mesh),
            Err(SkinError::DeadMesh)
        ));
    }

    #[test]
    #[should_panic(expected = "destroyed")]
    fn test_query_through_destroyed_bone_panics() {
        let (mut body, mesh, bone_a, _) = two_bone_character();
        let a_node = body.bone(bone_a).node();
        body.remove_subtree(a_node);
        // 顶点 0 的非零权重仍指向被销毁骨骼的槽位：必须响亮地失败
        let _ = body.deformed_vertex_location_at(mesh, 0);
    }

    #[test]
    #[should_panic(expected = "not covered by any skin section")]
    fn test_vertex_index_out_of_range_panics() {
        let (mut body, mesh, _, _) = two_bone_character();
        let _ = body.deformed_vertex_location_at(mesh, 99);
    }

    #[test]
    fn test_removing_mesh_unsubscribes_from_bones() {
        let (mut body, mesh, bone_a, bone_b) = two_bone_character();
        body.remove_skin_mesh(mesh).unwrap();
        assert!(body.bone(bone_a).listeners.is_empty());
        assert!(body.bone(bone_b).listeners.is_empty());

        // 网格退订后移动骨骼不应崩溃
        let a_node = body.bone(bone_a).node();
        body.set_local_translation(a_node, v(0.0, 1.0, 0.0));
    }

    #[test]
    fn test_rebind_rebases_deformation() {
        let (mut body, mesh, bone_a, _) = two_bone_character();
        let a_node = body.bone(bone_a).node();
        body.set_local_translation(a_node, v(0.0, 1.0, 0.0));
        assert!((body.deformed_vertex_location_at(mesh, 0) - v(0.0, 1.0, 0.0)).length() < 1e-5);

        // 重新绑定：当前姿态成为新的参考姿态，变形回到恒等
        body.bind_rest_pose();
        let rebased = body.deformed_vertex_location_at(mesh, 0);
        assert!((rebased - v(0.0, 0.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn test_draw_batches_follow_section_order() {
        init_logger();
        let mut body = SoftBody::new("character");
        let bone_a = body.add_bone("a", body.root()).unwrap();
        let bone_b = body.add_bone("b", body.root()).unwrap();
        let mesh = SkinMesh::new(vec![Vec3::ZERO; 8], 1, vec![0; 8], vec![1.0; 8], None).unwrap();
        let mesh_id = body.add_skin_mesh("skin", body.root(), mesh).unwrap();
        let s0 = body.add_section(mesh_id, 0, 5).unwrap();
        let s1 = body.add_section(mesh_id, 5, 3).unwrap();
        body.add_bone_to_section(mesh_id, s0, bone_a).unwrap();
        body.add_bone_to_section(mesh_id, s1, bone_a).unwrap();
        body.add_bone_to_section(mesh_id, s1, bone_b).unwrap();
        body.validate_sections(mesh_id).unwrap();
        body.bind_rest_pose();

        body.update_pose(mesh_id);
        let node = body.skin_mesh(mesh_id);
        let batches: Vec<_> = node.batches().collect();
        assert_eq!(batches.len(), 2);
        assert_eq!((batches[0].vertex_start, batches[0].vertex_count), (0, 5));
        assert_eq!((batches[1].vertex_start, batches[1].vertex_count), (5, 3));
        assert_eq!(batches[0].palette.len(), 1);
        assert_eq!(batches[1].palette.len(), 2);
        // 绑定时刻调色板矩阵为恒等
        assert!(batches[1].palette[1].abs_diff_eq(Mat4::IDENTITY, 1e-5));
    }

    #[test]
    fn test_multi_section_cursor_population() {
        init_logger();
        let mut body = SoftBody::new("character");
        let bone_a = body.add_bone("a", body.root()).unwrap();
        let bone_b = body.add_bone("b", body.root()).unwrap();
        let b_node = body.bone(bone_b).node();
        body.set_local_translation(b_node, v(1.0, 0.0, 0.0));

        // 两个分段各自有独立调色板；顶点槽位都指向本分段的 0 号骨骼
        let mesh = SkinMesh::new(
            (0..6).map(|i| v(i as f32, 0.0, 0.0)).collect(),
            1,
            vec![0; 6],
            vec![1.0; 6],
            Some(vec![0, 1, 2, 3, 4, 5]),
        )
        .unwrap();
        let mesh_id = body.add_skin_mesh("skin", body.root(), mesh).unwrap();
        let s0 = body.add_section(mesh_id, 0, 3).unwrap();
        let s1 = body.add_section(mesh_id, 3, 3).unwrap();
        body.add_bone_to_section(mesh_id, s0, bone_a).unwrap();
        body.add_bone_to_section(mesh_id, s1, bone_b).unwrap();
        body.validate_sections(mesh_id).unwrap();
        body.bind_rest_pose();

        // 移动 bone_b：只有后一个分段的顶点跟随
        body.set_local_translation(b_node, v(1.0, 4.0, 0.0));
        assert_eq!(body.ensure_face_cache(mesh_id), 6);
        let still = body.deformed_vertex_location_at(mesh_id, 1);
        let moved = body.deformed_vertex_location_at(mesh_id, 4);
        assert!((still - v(1.0, 0.0, 0.0)).length() < 1e-5);
        assert!((moved - v(4.0, 4.0, 0.0)).length() < 1e-5);
    }
}
