//! 任务依赖图
//!
//! 使用邻接表和入度表做 Kahn 拓扑排序；构建时校验重复 ID、悬空依赖与环，
//! 任一不满足即返回 ConfigError，不会产生半成品图。

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::CrewError;
use crate::workflow::types::{TaskDefinition, TaskId};

/// 已校验的任务 DAG，任务按声明顺序保存
#[derive(Debug, Clone)]
pub struct TaskGraph {
    tasks: Vec<TaskDefinition>,
    /// 任务 ID -> 声明下标
    index: HashMap<TaskId, usize>,
    /// 邻接表：声明下标 -> 依赖它的任务下标
    dependents: Vec<Vec<usize>>,
    /// 声明顺序优先的拓扑序
    topo: Vec<TaskId>,
}

impl TaskGraph {
    /// 从任务定义构建依赖图
    pub fn build(defs: Vec<TaskDefinition>) -> Result<Self, CrewError> {
        let mut index: HashMap<TaskId, usize> = HashMap::with_capacity(defs.len());
        for (i, def) in defs.iter().enumerate() {
            if def.name.trim().is_empty() {
                return Err(CrewError::config(format!("task #{} has an empty name", i + 1)));
            }
            if def.worker.trim().is_empty() {
                return Err(CrewError::config(format!(
                    "task '{}' has no responsible worker",
                    def.name
                )));
            }
            if index.insert(def.name.clone(), i).is_some() {
                return Err(CrewError::config(format!("duplicate task '{}'", def.name)));
            }
        }

        let mut in_degree = vec![0usize; defs.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); defs.len()];
        for (i, def) in defs.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &def.depends_on {
                if dep == &def.name {
                    return Err(CrewError::config(format!("task '{}' depends on itself", def.name)));
                }
                if !seen.insert(dep.as_str()) {
                    return Err(CrewError::config(format!(
                        "task '{}' lists dependency '{}' twice",
                        def.name, dep
                    )));
                }
                let &d = index.get(dep).ok_or_else(|| {
                    CrewError::config(format!(
                        "task '{}' depends on unknown task '{}'",
                        def.name, dep
                    ))
                })?;
                dependents[d].push(i);
                in_degree[i] += 1;
            }
        }

        // Kahn：每次取声明下标最小的零入度任务
        let mut ready: BTreeSet<usize> = (0..defs.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut topo = Vec::with_capacity(defs.len());
        while let Some(i) = ready.pop_first() {
            topo.push(defs[i].name.clone());
            for &j in &dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.insert(j);
                }
            }
        }
        if topo.len() != defs.len() {
            let cyclic: Vec<&str> = defs
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, d)| d.name.as_str())
                .collect();
            return Err(CrewError::config(format!(
                "dependency cycle among tasks: {}",
                cyclic.join(", ")
            )));
        }

        Ok(Self {
            tasks: defs,
            index,
            dependents,
            topo,
        })
    }

    /// 依赖全部在 completed 中、自身尚未完成的任务，按声明顺序
    pub fn ready_tasks(&self, completed: &HashSet<TaskId>) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|t| !completed.contains(&t.name))
            .filter(|t| t.depends_on.iter().all(|d| completed.contains(d)))
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn topological_order(&self) -> &[TaskId] {
        &self.topo
    }

    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn tasks(&self) -> &[TaskDefinition] {
        &self.tasks
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// 声明顺序的依赖列表
    pub fn dependencies(&self, id: &str) -> &[TaskId] {
        self.task(id).map(|t| t.depends_on.as_slice()).unwrap_or(&[])
    }

    /// 传递闭包：所有（直接或间接）依赖 id 的任务，不含 id 本身
    pub fn downstream_of(&self, id: &str) -> HashSet<TaskId> {
        let mut out = HashSet::new();
        let Some(&start) = self.index.get(id) else {
            return out;
        };
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            for &j in &self.dependents[i] {
                if out.insert(self.tasks[j].name.clone()) {
                    stack.push(j);
                }
            }
        }
        out
    }
}
