use serde::{Deserialize, Serialize};

/// 规范层级权重表
///
/// 层级 1（条约/基础条例）到 7（非约束性指南），上位法权重更高。
/// 加权分 = 向量相似度 × 对应层级权重。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyWeights {
    weights: [f32; 7],
}

impl Default for HierarchyWeights {
    fn default() -> Self {
        Self {
            weights: [1.5, 1.4, 1.3, 1.2, 1.1, 1.0, 0.9],
        }
    }
}

impl HierarchyWeights {
    pub fn new(weights: [f32; 7]) -> Self {
        Self { weights }
    }

    /// 层级超出 1..=7 时按最近的有效层级取值
    pub fn weight(&self, hierarchy_level: u8) -> f32 {
        let level = hierarchy_level.clamp(1, 7);
        self.weights[(level - 1) as usize]
    }

    pub fn weighted_score(&self, similarity: f32, hierarchy_level: u8) -> f32 {
        similarity * self.weight(hierarchy_level)
    }
}
