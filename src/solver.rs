use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::{coo::CooMatrix, csc::CscMatrix, factorization::CscCholesky};
use tracing::{debug, trace};

use argmin::{
    core::{
        observers::{Observe, ObserverMode},
        Error, Executor, Operator, State, KV,
    },
    solver::conjugategradient::ConjugateGradient,
};

use crate::{
    assembler::{EssentialBc, LinearSystem},
    error::{DamflowError, Result},
};

pub const MAX_DENSE_DOFS: usize = 15_000;
pub const MAX_DIRECT_DOFS: usize = 1_000_000;
pub const MAX_CG_ITER: u64 = 100_000;
pub const TARGET_CG_RESIDUAL: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverMethod {
    /// Cholesky factorisation of the reduced matrix, dense for small systems
    /// and sparse above `max_dense_dofs`
    #[default]
    Direct,
    /// Conjugate gradient on the sparse reduced matrix
    ConjugateGradient,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverSettings {
    pub method: SolverMethod,
    /// Largest reduced system the direct method factorises densely
    pub max_dense_dofs: usize,
    /// Largest reduced system the direct method accepts at all
    pub max_direct_dofs: usize,
    /// Conjugate gradient stops once the residual norm drops below this
    /// fraction of the right hand side norm
    pub cg_tolerance: f64,
    pub cg_max_iterations: u64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        SolverSettings {
            method: SolverMethod::Direct,
            max_dense_dofs: MAX_DENSE_DOFS,
            max_direct_dofs: MAX_DIRECT_DOFS,
            cg_tolerance: TARGET_CG_RESIDUAL,
            cg_max_iterations: MAX_CG_ITER,
        }
    }
}

/// Nodal results of a solve
#[derive(Debug, Clone, PartialEq)]
pub struct SolutionField {
    /// Piezometric head per node
    pub head: DVector<f64>,
    /// Reaction flux `K a - f`, non-zero only where the head is prescribed
    pub reaction: DVector<f64>,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Prescribed(usize),
    Free(usize),
}

/// Degrees of freedom split into prescribed (known head) and free ones
#[derive(Debug, Clone)]
struct Partition {
    prescribed: Vec<usize>,
    prescribed_head: Vec<f64>,
    free: Vec<usize>,
    slots: Vec<Slot>,
}

impl Partition {
    fn new(num_dofs: usize, essential: &[EssentialBc]) -> Result<Partition> {
        let mut known: BTreeMap<usize, f64> = BTreeMap::new();
        for bc in essential {
            if bc.node >= num_dofs {
                return Err(DamflowError::Input(format!(
                    "essential boundary condition refers to node {}, system has {num_dofs} dofs",
                    bc.node
                )));
            }
            if !bc.head.is_finite() {
                return Err(DamflowError::Input(format!(
                    "prescribed head at node {} is {}",
                    bc.node, bc.head
                )));
            }
            known.insert(bc.node, bc.head);
        }

        let mut prescribed = Vec::with_capacity(known.len());
        let mut prescribed_head = Vec::with_capacity(known.len());
        let mut free = Vec::with_capacity(num_dofs - known.len());
        let mut slots = Vec::with_capacity(num_dofs);

        for dof in 0..num_dofs {
            if let Some(head) = known.get(&dof) {
                slots.push(Slot::Prescribed(prescribed.len()));
                prescribed.push(dof);
                prescribed_head.push(*head);
            } else {
                slots.push(Slot::Free(free.len()));
                free.push(dof);
            }
        }

        Ok(Partition {
            prescribed,
            prescribed_head,
            free,
            slots,
        })
    }
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// The reduced matrix of a conductivity problem is invertible exactly when
/// every connected group of nodes holds at least one prescribed head.
fn check_anchored(stiffness: &CscMatrix<f64>, partition: &Partition) -> Result<()> {
    let n = partition.slots.len();
    let mut parent: Vec<usize> = (0..n).collect();
    let mut has_diagonal = vec![false; n];

    for (i, j, v) in stiffness.triplet_iter() {
        if i == j {
            has_diagonal[i] |= *v != 0.0;
            continue;
        }
        let (ri, rj) = (find_root(&mut parent, i), find_root(&mut parent, j));
        if ri != rj {
            parent[ri] = rj;
        }
    }

    if let Some(&dof) = partition.free.iter().find(|&&dof| !has_diagonal[dof]) {
        return Err(DamflowError::singular(format!(
            "node {dof} has no conductivity and no prescribed head"
        )));
    }

    let mut anchored = vec![false; n];
    for &dof in &partition.prescribed {
        let root = find_root(&mut parent, dof);
        anchored[root] = true;
    }

    let floating: Vec<usize> = partition
        .free
        .iter()
        .copied()
        .filter(|&dof| !anchored[find_root(&mut parent, dof)])
        .collect();

    if let Some(first) = floating.first() {
        return Err(DamflowError::singular(format!(
            "{} nodes (first: node {first}) are not connected to any prescribed head",
            floating.len()
        )));
    }

    Ok(())
}

/// Builds `f_F - K_FP a_P`
fn build_reduced_load(system: &LinearSystem, partition: &Partition) -> DVector<f64> {
    let mut reduced: DVector<f64> =
        DVector::from_iterator(partition.free.len(), partition.free.iter().map(|&dof| system.load[dof]));

    for (row, col, value) in system.stiffness.triplet_iter() {
        if let (Slot::Free(r), Slot::Prescribed(c)) = (partition.slots[row], partition.slots[col]) {
            reduced[r] -= value * partition.prescribed_head[c];
        }
    }

    reduced
}

/// Copies `K_FF` into a dense matrix
fn build_dense_unknown_matrix(system: &LinearSystem, partition: &Partition) -> DMatrix<f64> {
    let num_free = partition.free.len();
    let mut unknown_matrix: DMatrix<f64> = DMatrix::zeros(num_free, num_free);

    for (row, col, value) in system.stiffness.triplet_iter() {
        if let (Slot::Free(r), Slot::Free(c)) = (partition.slots[row], partition.slots[col]) {
            unknown_matrix[(r, c)] += *value;
        }
    }

    unknown_matrix
}

/// Copies `K_FF` into a sparse matrix
fn build_sparse_unknown_matrix(system: &LinearSystem, partition: &Partition) -> CscMatrix<f64> {
    let num_free = partition.free.len();
    let mut triplets: CooMatrix<f64> = CooMatrix::new(num_free, num_free);

    for (row, col, value) in system.stiffness.triplet_iter() {
        if let (Slot::Free(r), Slot::Free(c)) = (partition.slots[row], partition.slots[col]) {
            triplets.push(r, c, *value);
        }
    }

    CscMatrix::from(&triplets)
}

fn run_cholesky(
    system: &LinearSystem,
    partition: &Partition,
    reduced_load: &DVector<f64>,
    settings: &SolverSettings,
) -> Result<DVector<f64>> {
    let num_free = partition.free.len();
    if num_free > settings.max_direct_dofs {
        return Err(DamflowError::ResourceExhaustion {
            what: "free dofs for the direct solver",
            requested: num_free,
            limit: settings.max_direct_dofs,
        });
    }

    if num_free <= settings.max_dense_dofs {
        let unknown_matrix = build_dense_unknown_matrix(system, partition);
        let cholesky = unknown_matrix.cholesky().ok_or_else(|| {
            DamflowError::singular("reduced conductivity matrix is not positive definite")
        })?;
        return Ok(cholesky.solve(reduced_load));
    }

    debug!("{num_free} free dofs, using sparse cholesky");
    let unknown_matrix = build_sparse_unknown_matrix(system, partition);
    let cholesky = CscCholesky::factor(&unknown_matrix).map_err(|_| {
        DamflowError::singular("reduced conductivity matrix is not positive definite")
    })?;

    let rhs = DMatrix::from_column_slice(num_free, 1, reduced_load.as_slice());
    let solution = cholesky.solve(&rhs);
    Ok(DVector::from_column_slice(solution.as_slice()))
}

/// Runs multiplication for Conjugate Gradient Solver
struct ConjugateGradientOperator<'a> {
    a: &'a CscMatrix<f64>,
}

impl<'a> Operator for ConjugateGradientOperator<'a> {
    type Param = Vec<f64>;
    type Output = Vec<f64>;

    fn apply(&self, x: &Self::Param) -> std::result::Result<Self::Output, Error> {
        let product = self.a * &DVector::from_column_slice(x);
        Ok(product.iter().copied().collect())
    }
}

/// Reports the residual of every conjugate gradient iteration
struct ConjugateGradientObserver;

impl<I> Observe<I> for ConjugateGradientObserver
where
    I: State<Float = f64>,
{
    fn observe_init(&mut self, name: &str, _state: &I, _kv: &KV) -> std::result::Result<(), Error> {
        trace!("starting {name}");
        Ok(())
    }

    fn observe_iter(&mut self, state: &I, _kv: &KV) -> std::result::Result<(), Error> {
        trace!("iteration {}: residual {:e}", state.get_iter(), state.get_cost().sqrt());
        Ok(())
    }

    fn observe_final(&mut self, state: &I) -> std::result::Result<(), Error> {
        trace!("finished after {} iterations", state.get_iter());
        Ok(())
    }
}

/// Solves `K_FF a_F = b` with the conjugate gradient method on the sparse
/// reduced matrix
fn run_conjugate_gradient(
    system: &LinearSystem,
    partition: &Partition,
    reduced_load: &DVector<f64>,
    settings: &SolverSettings,
) -> Result<DVector<f64>> {
    let load_norm = reduced_load.norm();
    if load_norm == 0.0 {
        return Ok(DVector::zeros(reduced_load.len()));
    }

    let unknown_matrix = build_sparse_unknown_matrix(system, partition);
    let target_residual = settings.cg_tolerance * load_norm;
    // argmin reports the squared residual norm as the cost
    let target_cost = target_residual * target_residual;

    let b_flat: Vec<f64> = reduced_load.iter().copied().collect();
    let solver: ConjugateGradient<_, f64> = ConjugateGradient::new(b_flat);
    let initial_guess: Vec<f64> = vec![0.0; reduced_load.len()];

    let operator = ConjugateGradientOperator { a: &unknown_matrix };

    let res = Executor::new(operator, solver)
        .configure(|state| {
            state
                .param(initial_guess)
                .max_iters(settings.cg_max_iterations)
                .target_cost(target_cost)
        })
        .add_observer(ConjugateGradientObserver, ObserverMode::Always)
        .run()
        .map_err(|err| DamflowError::singular(format!("conjugate gradient error: {err}")))?;

    let state = res.state();
    let best_cost = state.get_best_cost();
    if !(best_cost <= target_cost) {
        return Err(DamflowError::NonConvergence {
            iterations: state.get_iter(),
            residual: best_cost.sqrt() / load_norm,
        });
    }

    match &state.best_param {
        Some(vec) => Ok(DVector::from_vec(vec.clone())),
        None => Err(DamflowError::singular(
            "conjugate gradient could not produce a solution",
        )),
    }
}

/// Solves `K a = f` for the heads with the given essential boundary
/// conditions using the default settings
pub fn solve(system: &LinearSystem, essential: &[EssentialBc]) -> Result<SolutionField> {
    solve_with(system, essential, &SolverSettings::default())
}

/// Partitions the dofs into prescribed set `P` and free set `F`, solves
/// `K_FF a_F = f_F - K_FP a_P`, scatters both parts into the full head vector
/// and computes the reaction flux `r = K a - f`.
///
/// # Arguments
/// * `system` - Assembled conductivity matrix and load vector
/// * `essential` - Prescribed heads, at least one per connected node group
/// * `settings` - Solution method and its size and tolerance limits
pub fn solve_with(
    system: &LinearSystem,
    essential: &[EssentialBc],
    settings: &SolverSettings,
) -> Result<SolutionField> {
    let num_dofs = system.num_dofs();

    if essential.is_empty() {
        return Err(DamflowError::singular(
            "no prescribed heads, the head is only known up to a constant",
        ));
    }

    let partition = Partition::new(num_dofs, essential)?;
    check_anchored(&system.stiffness, &partition)?;

    let reduced_load = build_reduced_load(system, &partition);

    let start = std::time::Instant::now();
    let free_head = if partition.free.is_empty() {
        DVector::zeros(0)
    } else {
        match settings.method {
            SolverMethod::Direct => run_cholesky(system, &partition, &reduced_load, settings)?,
            SolverMethod::ConjugateGradient => {
                run_conjugate_gradient(system, &partition, &reduced_load, settings)?
            }
        }
    };
    debug!(
        "solved {} free dofs ({} prescribed) in {:.3} seconds",
        partition.free.len(),
        partition.prescribed.len(),
        start.elapsed().as_secs_f32()
    );

    if let Some(dof) = free_head.iter().position(|h| !h.is_finite()) {
        return Err(DamflowError::singular(format!(
            "solution is not finite at node {}",
            partition.free[dof]
        )));
    }

    let mut head: DVector<f64> = DVector::zeros(num_dofs);
    for (dof, value) in partition.prescribed.iter().zip(&partition.prescribed_head) {
        head[*dof] = *value;
    }
    for (dof, value) in partition.free.iter().zip(free_head.iter()) {
        head[*dof] = *value;
    }

    let reaction = &system.stiffness * &head - &system.load;

    Ok(SolutionField { head, reaction })
}
